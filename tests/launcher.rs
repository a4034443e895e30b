use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sample_recon::{LauncherHandle, MulticoreLauncher, TaskPool};

#[test]
fn every_pushed_index_is_popped_exactly_once() {
    let pool = TaskPool::new(4);
    let launcher = MulticoreLauncher::with_pool(&pool);
    launcher.push(|_, i| Ok(i), 7, 50);

    let mut seen = HashSet::new();
    for left in (0..50).rev() {
        let task = launcher.pop();
        assert_eq!(task.index, task.result);
        assert!(seen.insert(task.index), "index {} popped twice", task.index);
        assert_eq!(launcher.num_tasks(), left);
    }
    assert_eq!(seen, (7..57).collect());
}

#[test]
fn pushes_chain() {
    let pool = TaskPool::new(2);
    let launcher = MulticoreLauncher::with_pool(&pool);
    launcher
        .push(|_, i| Ok(i), 0, 3)
        .push(|_, i| Ok(i * 10), 10, 2);
    assert_eq!(launcher.num_tasks(), 5);

    let mut results: Vec<_> = launcher.pop_all(None).into_iter().map(|t| t.result).collect();
    results.sort();
    assert_eq!(results, vec![0, 1, 2, 100, 110]);
}

/// Visits a binary tree in heap numbering, one task per node.
fn split(handle: &LauncherHandle<usize>, node: usize) -> anyhow::Result<usize> {
    if node < 8 {
        handle.push(split, node * 2, 2);
    }
    Ok(node)
}

#[test]
fn children_pushed_from_tasks_are_collected() {
    let pool = TaskPool::new(3);
    let launcher = MulticoreLauncher::with_pool(&pool);
    launcher.push(split, 1, 1);

    let mut nodes: Vec<_> = launcher.pop_all(None).into_iter().map(|t| t.result).collect();
    nodes.sort();
    assert_eq!(nodes, (1..16).collect::<Vec<_>>());
    assert_eq!(launcher.num_tasks(), 0);
}

#[test]
fn single_thread_fills_shared_results() {
    let pool = TaskPool::new(1);
    let results = Arc::new(Mutex::new(vec![]));
    let launcher = MulticoreLauncher::with_pool(&pool);

    let sink = results.clone();
    launcher.push(
        move |_, i| {
            sink.lock().push(i);
            Ok(())
        },
        0,
        10,
    );
    let done = launcher.pop_all(Some("no-op tasks"));
    assert_eq!(done.len(), 10);

    let mut results = results.lock().clone();
    results.sort();
    assert_eq!(results, (0..10).collect::<Vec<_>>());
}

#[test]
fn worker_count_follows_the_desired_count() {
    let pool = TaskPool::new(2);
    let launcher = MulticoreLauncher::<()>::with_pool(&pool);
    assert_eq!(pool.live_threads(), 2);

    pool.set_num_threads(5);
    assert_eq!(pool.live_threads(), 5);
    pool.set_num_threads(1);
    assert_eq!(pool.live_threads(), 1);

    launcher.push(|_, _| Ok(()), 0, 20);
    assert_eq!(launcher.pop_all(None).len(), 20);
}

#[test]
fn finished_count_never_exceeds_outstanding() {
    let pool = TaskPool::new(2);
    let launcher = MulticoreLauncher::with_pool(&pool);
    launcher.push(|_, i| Ok(i), 0, 8);

    while launcher.num_tasks() > 0 {
        assert!(launcher.num_finished() <= launcher.num_tasks());
        launcher.pop();
    }
    assert_eq!(launcher.num_finished(), 0);
}

#[test]
fn shrinking_while_the_last_launcher_detaches_returns() {
    for _ in 0..100 {
        let pool = TaskPool::new(16);
        let launcher = MulticoreLauncher::with_pool(&pool);
        launcher.push(
            |_, i| {
                thread::sleep(Duration::from_millis(1));
                Ok(i)
            },
            0,
            16,
        );

        let resizer = {
            let pool = pool.clone();
            thread::spawn(move || pool.set_num_threads(1))
        };
        drop(launcher);
        resizer.join().unwrap();
        assert_eq!(pool.num_threads(), 1);
    }
}
