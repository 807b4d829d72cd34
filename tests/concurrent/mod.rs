use crate::{default_executor, run_in, tool_output};
use benchbox::cgroup::{parse_int_list, Controller};
use benchbox::cpu_alloc::Slot;
use benchbox::{CoreAllocator, TerminationReason};
use serial_test::serial;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;

#[test]
#[serial]
fn test_concurrent_runs_get_disjoint_cores() {
    let Some(executor) = default_executor() else { return };
    if !executor.backend().controllers().contains(&Controller::Cpuset) {
        eprintln!("Skipping: no cpuset controller");
        return;
    }
    let allowed: Vec<usize> = executor.backend().allowed_cpus().unwrap().into_iter().collect();
    if allowed.len() < 2 {
        eprintln!("Skipping: need at least two CPUs");
        return;
    }
    let slots = allowed[..2]
        .iter()
        .map(|&core| Slot {
            cores: BTreeSet::from([core]),
            memory_nodes: None,
        })
        .collect();
    let allocator = CoreAllocator::new(slots, false);
    let in_use: Arc<Mutex<Vec<BTreeSet<usize>>>> = Arc::new(Mutex::new(Vec::new()));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let executor = executor.clone();
            let allocator = allocator.clone();
            let in_use = Arc::clone(&in_use);
            thread::spawn(move || {
                let lease = allocator.acquire().unwrap();
                {
                    let mut in_use = in_use.lock().unwrap();
                    assert!(in_use.iter().all(|cores| cores.is_disjoint(lease.cores())));
                    in_use.push(lease.cores().clone());
                }

                let dir = TempDir::new().unwrap();
                let mut run = run_in(
                    &dir,
                    &["sh", "-c", "grep Cpus_allowed_list /proc/self/status; sleep 0.5"],
                );
                run.limits.cores = Some(lease.cores().clone());
                let result = executor.execute(&run).expect("Run failed");
                assert_eq!(result.termination_reason, None::<TerminationReason>);

                let output = tool_output(&run.output_file);
                let list = output
                    .split_once(':')
                    .map(|(_, list)| list.trim().to_string())
                    .unwrap();
                assert_eq!(&parse_int_list(&list).unwrap(), lease.cores());

                in_use.lock().unwrap().retain(|cores| cores != lease.cores());
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(in_use.lock().unwrap().is_empty());
}

#[test]
fn test_allocator_blocks_until_a_slot_is_free() {
    let slot = Slot {
        cores: BTreeSet::from([0]),
        memory_nodes: None,
    };
    let allocator = CoreAllocator::new(vec![slot], false);
    let first = allocator.acquire().unwrap();
    assert!(allocator.try_acquire().is_none());

    let waiting = {
        let allocator = allocator.clone();
        thread::spawn(move || allocator.acquire().unwrap().index())
    };
    thread::sleep(std::time::Duration::from_millis(50));
    assert!(!waiting.is_finished());
    drop(first);
    assert_eq!(waiting.join().unwrap(), 0);
}
