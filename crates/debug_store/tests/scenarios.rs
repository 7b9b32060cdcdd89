use std::sync::{Arc, Barrier};
use std::thread;

use debug_store::sim::SimPlatform;
use debug_store::{
    BtsRecord, CpuFeatures, DebugStore, DsConfiguration, DsError, Qualifier, Target, Task,
    BTS_KERNEL, BTS_USER, CORE2_ATOM, DS_ALIGNMENT, MSR_IA32_DEBUGCTLMSR, MSR_IA32_DS_AREA,
};
use rstest::rstest;

fn store(dtes64: bool, nr_cpus: usize) -> DebugStore<SimPlatform> {
    let config = DsConfiguration::configure(
        &CORE2_ATOM,
        CpuFeatures {
            dtes64,
            bts: true,
            pebs: true,
        },
    );
    DebugStore::new(config, nr_cpus, Arc::new(SimPlatform::new(nr_cpus))).unwrap()
}

#[test]
fn test_cpu_tracer_on_small_buffer() {
    let store = store(false, 1);
    assert_eq!(store.format().record_size(), 12);

    let tracer = store
        .request_bts_tracer(&Target::CurrentCpu, vec![0; 64], None, None, BTS_KERNEL)
        .unwrap();
    let trace = *tracer.trace();

    assert_eq!(trace.begin % DS_ALIGNMENT as u64, 0);
    let align_loss = (trace.begin - tracer.buffer_base()) as usize;
    assert_eq!(trace.n, (64 - align_loss) / 12);
    assert_eq!(trace.end, trace.begin + (trace.n * 12) as u64);
    assert_eq!(trace.top, trace.begin);
    assert!(trace.ith > trace.end);

    store.release_bts_tracer(tracer).unwrap();
}

#[test]
fn test_filling_the_buffer_wraps_to_begin() {
    let store = store(false, 1);
    let mut tracer = store
        .request_bts_tracer(&Target::CurrentCpu, vec![0; 64], None, None, BTS_KERNEL)
        .unwrap();
    let n = tracer.trace().n;
    let begin = tracer.trace().begin;

    for i in 0..n as u64 - 1 {
        let written = store
            .write_bts_record(&tracer, &BtsRecord::Branch { from: 0x100 + i, to: 0x200 + i })
            .unwrap();
        assert_eq!(written, 12);
        assert_eq!(store.read_bts_trace(&mut tracer).top, begin + 12 * (i + 1));
    }

    // the last record reaches the absolute maximum
    let last = BtsRecord::Branch { from: 0x1ff, to: 0x2ff };
    assert_eq!(store.write_bts_record(&tracer, &last).unwrap(), 12);
    assert_eq!(store.read_bts_trace(&mut tracer).top, begin);

    let records = tracer.records().unwrap();
    assert_eq!(records.len(), n);
    assert_eq!(records[0], BtsRecord::Branch { from: 0x100, to: 0x200 });
    assert_eq!(records[n - 1], last);

    store.release_bts_tracer(tracer).unwrap();
}

#[test]
fn test_write_past_the_end_is_short() {
    let store = store(false, 1);
    let rec_size = store.config().record_size(Qualifier::Pebs);
    assert_eq!(rec_size, 40);

    let mut tracer = store
        .request_pebs_tracer(&Target::CurrentCpu, vec![0; 88], None, None, 0)
        .unwrap();
    let begin = tracer.trace().ds.begin;
    assert_eq!(tracer.trace().ds.n, 2);

    assert_eq!(store.write_pebs_records(&tracer, &[1; 40]).unwrap(), 40);

    // two records offered, room for one
    assert_eq!(store.write_pebs_records(&tracer, &[2; 80]).unwrap(), 40);
    assert_eq!(store.read_pebs_trace(&mut tracer).ds.top, begin);

    // the next call continues at the start of the buffer
    assert_eq!(store.write_pebs_records(&tracer, &[3; 40]).unwrap(), 40);
    assert_eq!(store.read_pebs_trace(&mut tracer).ds.top, begin + 40);

    let raw = tracer.raw_records().unwrap();
    assert!(raw[..40].iter().all(|&b| b == 3));
    assert!(raw[40..].iter().all(|&b| b == 2));

    store.release_pebs_tracer(tracer).unwrap();
}

#[test]
fn test_release_keeps_shared_context() {
    let store = store(true, 1);
    let bts = store
        .request_bts_tracer(&Target::CurrentCpu, vec![0; 512], None, None, BTS_USER)
        .unwrap();
    let pebs = store
        .request_pebs_tracer(&Target::CurrentCpu, vec![0; 1024], None, None, 0)
        .unwrap();

    let context = pebs.context().clone();
    assert_eq!(context.use_count(), 2);
    let ds_area = store.platform().register(0, MSR_IA32_DS_AREA);
    assert_eq!(ds_area, context.ds_address());

    store.release_bts_tracer(bts).unwrap();

    assert_eq!(context.use_count(), 1);
    assert!(Arc::ptr_eq(&store.cpu_context(0).unwrap(), &context));
    assert_eq!(store.platform().register(0, MSR_IA32_DS_AREA), ds_area);

    store.release_pebs_tracer(pebs).unwrap();
    assert_eq!(store.platform().register(0, MSR_IA32_DS_AREA), 0);
    assert!(store.cpu_context(0).is_none());
}

#[test]
fn test_thread_request_denied_while_cpu_tracer_outstanding() {
    let store = store(true, 1);
    let cpu = store
        .request_bts_tracer(&Target::CurrentCpu, vec![0; 512], None, None, 0)
        .unwrap();

    let task = Task::new(42);
    assert!(matches!(
        store.request_bts_tracer(&Target::Task(task.clone()), vec![0; 512], None, None, 0),
        Err(DsError::PermissionDenied(_))
    ));
    assert!(task.context().is_none());

    store.release_bts_tracer(cpu).unwrap();
    let tracer = store
        .request_bts_tracer(&Target::Task(task.clone()), vec![0; 512], None, None, 0)
        .unwrap();
    assert!(matches!(
        store.request_bts_tracer(&Target::CurrentCpu, vec![0; 512], None, None, 0),
        Err(DsError::PermissionDenied(_))
    ));
    store.release_bts_tracer(tracer).unwrap();
}

#[rstest]
#[case(vec![true, true, false, true])]
#[case(vec![false, false, true])]
#[case(vec![true, false, false, true, true])]
fn test_allocation_counter_never_mixes(#[case] requests: Vec<bool>) {
    let store = store(true, 1);
    let mut outstanding: Vec<bool> = Vec::new();

    for per_thread in requests {
        let conflicting = outstanding.iter().any(|&held| held != per_thread);
        let result = store.acquire_allocation_slot(per_thread);
        assert_eq!(result.is_err(), conflicting);
        if result.is_ok() {
            outstanding.push(per_thread);
        }

        let count = store.allocation_count();
        assert!(outstanding.iter().all(|&held| held == (count > 0)));
    }

    while let Some(per_thread) = outstanding.pop() {
        store.release_allocation_slot(per_thread);
    }
    assert_eq!(store.allocation_count(), 0);
}

#[test]
fn test_concurrent_get_context_installs_one() {
    const THREADS: usize = 8;

    let store = Arc::new(store(true, 1));
    let task = Task::new(7);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = store.clone();
            let task = task.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                store.get_context(&Target::Task(task)).unwrap()
            })
        })
        .collect();
    let contexts: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let first = &contexts[0];
    assert!(contexts.iter().all(|context| Arc::ptr_eq(context, first)));
    assert_eq!(first.use_count(), THREADS);
    assert!(Arc::ptr_eq(&task.context().unwrap(), first));

    let freed = Arc::downgrade(first);
    let handles: Vec<_> = contexts
        .into_iter()
        .map(|context| {
            let store = store.clone();
            thread::spawn(move || store.put_context(context))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(task.context().is_none());
    assert!(!task.has_ds_area());
    assert!(freed.upgrade().is_none());
    assert_eq!(store.platform().waited_for(), vec![7]);
}

#[test]
fn test_one_master_per_context() {
    let store = store(true, 1);
    let task = Task::new(9);
    let target = Target::Task(task.clone());

    let first = store
        .request_bts_tracer(&target, vec![0; 512], None, None, 0)
        .unwrap();
    assert_eq!(
        store
            .request_bts_tracer(&target, vec![0; 512], None, None, 0)
            .err(),
        Some(DsError::PermissionDenied("context already has a tracer"))
    );
    assert_eq!(first.context().use_count(), 1);
    assert_eq!(store.allocation_count(), 1);

    store.release_bts_tracer(first).unwrap();
    let second = store
        .request_bts_tracer(&target, vec![0; 512], None, None, 0)
        .unwrap();
    store.release_bts_tracer(second).unwrap();
    assert_eq!(store.allocation_count(), 0);
}

#[test]
fn test_cpu_contexts_are_per_cpu() {
    let store = store(true, 2);
    let first = store
        .request_bts_tracer(&Target::CurrentCpu, vec![0; 512], None, None, 0)
        .unwrap();

    store.platform().set_current(1, None);
    let second = store
        .request_bts_tracer(&Target::CurrentCpu, vec![0; 512], None, None, 0)
        .unwrap();

    assert!(!Arc::ptr_eq(first.context(), second.context()));
    assert_eq!(first.context().cpu(), Some(0));
    assert_eq!(second.context().cpu(), Some(1));
    assert_eq!(
        store.platform().register(1, MSR_IA32_DS_AREA),
        second.context().ds_address()
    );

    store.release_bts_tracer(second).unwrap();
    store.platform().set_current(0, None);
    store.release_bts_tracer(first).unwrap();
    assert_eq!(store.allocation_count(), 0);
}

#[test]
fn test_cpu_tracer_released_only_on_its_cpu() {
    let store = store(true, 2);
    let platform = store.platform().clone();

    let first = store
        .request_bts_tracer(&Target::CurrentCpu, vec![0; 512], None, None, BTS_KERNEL)
        .unwrap();
    platform.set_current(1, None);
    let second = store
        .request_bts_tracer(&Target::CurrentCpu, vec![0; 512], None, None, BTS_KERNEL)
        .unwrap();

    let registers = |cpu| {
        (
            platform.register(cpu, MSR_IA32_DS_AREA),
            platform.register(cpu, MSR_IA32_DEBUGCTLMSR),
        )
    };
    let cpu0 = registers(0);
    let cpu1 = registers(1);
    assert_eq!(cpu0.0, first.context().ds_address());
    assert_ne!(cpu0.1, 0);

    // running on cpu 1, cpu 0's tracer stays untouched
    assert!(matches!(
        store.suspend_bts_tracer(&first),
        Err(DsError::PermissionDenied(_))
    ));
    let refused = store.release_bts_tracer(first).unwrap_err();
    assert!(matches!(refused.error, DsError::PermissionDenied(_)));
    let first = refused.tracer;

    assert_eq!(registers(0), cpu0);
    assert_eq!(registers(1), cpu1);
    assert_eq!(first.context().use_count(), 1);
    assert_eq!(first.active_flags(), BTS_KERNEL);
    assert_eq!(second.active_flags(), BTS_KERNEL);
    assert_eq!(store.allocation_count(), -2);

    store.release_bts_tracer(second).unwrap();
    assert_eq!(registers(1), (0, 0));

    platform.set_current(0, None);
    store.release_bts_tracer(first).unwrap();
    assert_eq!(registers(0), (0, 0));
    assert_eq!(store.allocation_count(), 0);
}

#[test]
fn test_threshold_without_room_is_rejected() {
    let store = store(true, 1);

    // four records fit, a threshold of four would sit at the very start
    assert_eq!(
        store
            .request_bts_tracer(&Target::CurrentCpu, vec![0; 8 + 4 * 24], None, Some(4), 0)
            .err(),
        Some(DsError::InvalidArgument("threshold leaves no room in the buffer"))
    );
    assert_eq!(store.allocation_count(), 0);
    assert!(store.cpu_context(0).is_none());

    let tracer = store
        .request_bts_tracer(&Target::CurrentCpu, vec![0; 8 + 4 * 24], None, Some(3), 0)
        .unwrap();
    assert!(tracer.trace().ith > tracer.trace().begin);
    store.release_bts_tracer(tracer).unwrap();
}
