use log::info;

/// Size of the hardware-visible DS descriptor block, large enough for every layout.
pub const MAX_SIZEOF_DS: usize = 12 * 8;

/// Alignment required for the start of a BTS or PEBS buffer.
pub const DS_ALIGNMENT: usize = 1 << 3;

/// Number of control masks in a configuration.
pub const DSF_CTL_MAX: usize = 5;

/// Sub-buffer of the Debug Store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qualifier {
    Bts = 0,
    Pebs = 1,
}

impl Qualifier {
    pub fn name(self) -> &'static str {
        match self {
            Qualifier::Bts => "bts",
            Qualifier::Pebs => "pebs",
        }
    }
}

/// Control features, each mapped to a mask of the debug-control register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsFeature {
    /// Enable branch trace store
    Bts = 0,
    /// Suppress kernel-mode branches
    BtsOffKernel,
    /// Suppress user-mode branches
    BtsOffUser,
    /// Raise an interrupt at the threshold
    BtsOverflow,
    Pebs,
}

/// Control masks of a CPU model family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPreset {
    pub name: &'static str,
    pub ctl: [u64; DSF_CTL_MAX],
}

pub const NETBURST: ModelPreset = ModelPreset {
    name: "Netburst",
    ctl: [(1 << 2) | (1 << 3), 1 << 5, 1 << 6, 0, 0],
};

pub const PENTIUM_M: ModelPreset = ModelPreset {
    name: "Pentium M",
    ctl: [(1 << 6) | (1 << 7), 0, 0, 0, 0],
};

pub const CORE2_ATOM: ModelPreset = ModelPreset {
    name: "Core 2/Atom",
    ctl: [(1 << 6) | (1 << 7), 1 << 9, 1 << 10, 0, 0],
};

pub const CORE_I7: ModelPreset = ModelPreset {
    name: "Core i7",
    ctl: [(1 << 6) | (1 << 7), 1 << 9, 1 << 10, 0, 0],
};

/// Debug Store capabilities reported by the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    /// 64-bit DS layout
    pub dtes64: bool,
    pub bts: bool,
    pub pebs: bool,
}

/// Layout and control constants of the Debug Store for one CPU model.
///
/// Built once when the CPU is identified and read-only afterwards. A record
/// size of zero means the CPU lacks that feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsConfiguration {
    pub name: &'static str,
    /// Width of a pointer field in the DS area and in BTS records (4 or 8)
    pub sizeof_ptr_field: usize,
    /// Record sizes indexed by [`Qualifier`]
    pub sizeof_rec: [usize; 2],
    /// Control masks indexed by [`DsFeature`]
    pub ctl: [u64; DSF_CTL_MAX],
}

impl DsConfiguration {
    /// Derives the configuration for a model family from the CPU's DS capabilities.
    pub fn configure(preset: &ModelPreset, cpu: CpuFeatures) -> Self {
        info!("Using {} configuration", preset.name);

        let sizeof_ptr_field = if cpu.dtes64 { 8 } else { 4 };
        let nr_pebs_fields = if cpu.dtes64 { 18 } else { 10 };

        let mut sizeof_rec = [sizeof_ptr_field * 3, sizeof_ptr_field * nr_pebs_fields];
        if !cpu.bts {
            sizeof_rec[Qualifier::Bts as usize] = 0;
            info!("BTS not available");
        }
        if !cpu.pebs {
            sizeof_rec[Qualifier::Pebs as usize] = 0;
            info!("PEBS not available");
        }

        info!(
            "Sizes: address: {} bit, bts record: {} bytes, pebs record: {} bytes",
            8 * sizeof_ptr_field,
            sizeof_rec[Qualifier::Bts as usize],
            sizeof_rec[Qualifier::Pebs as usize]
        );

        Self {
            name: preset.name,
            sizeof_ptr_field,
            sizeof_rec,
            ctl: preset.ctl,
        }
    }

    pub fn ctl(&self, feature: DsFeature) -> u64 {
        self.ctl[feature as usize]
    }

    pub fn record_size(&self, qual: Qualifier) -> usize {
        self.sizeof_rec[qual as usize]
    }

    /// All debug-control bits owned by BTS
    pub fn bts_control(&self) -> u64 {
        self.ctl(DsFeature::Bts)
            | self.ctl(DsFeature::BtsOffKernel)
            | self.ctl(DsFeature::BtsOffUser)
            | self.ctl(DsFeature::BtsOverflow)
    }
}
