use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use super::super::progress::{FrameProgress, WppSync};

#[test]
fn test_await_row_阻塞到报告为止() {
    let progress = Arc::new(FrameProgress::new());
    let (tx, rx) = mpsc::channel();
    let waiter = {
        let progress = progress.clone();
        thread::spawn(move || {
            let row = progress.await_row(32);
            tx.send(row).unwrap();
        })
    };

    progress.report(16);
    assert!(
        rx.recv_timeout(Duration::from_millis(50)).is_err(),
        "第 16 行时不应唤醒等待第 32 行的线程"
    );
    progress.report(40);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 40);
    waiter.join().unwrap();
}

#[test]
fn test_abort_释放参考帧等待方() {
    let progress = Arc::new(FrameProgress::new());
    let waiter = {
        let progress = progress.clone();
        thread::spawn(move || progress.await_row(1 << 20))
    };
    progress.abort();
    waiter.join().unwrap();
    assert!(progress.is_done());
}

#[test]
fn test_wpp_等待上一行第二个_ctb() {
    let sync = Arc::new(WppSync::new(2));
    let (tx, rx) = mpsc::channel();
    let waiter = {
        let sync = sync.clone();
        thread::spawn(move || {
            tx.send(sync.await_ctb(0, 2)).unwrap();
        })
    };

    sync.report(0, 1);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    sync.report(0, 2);
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    waiter.join().unwrap();
}

#[test]
fn test_wpp_中止后等待返回_false() {
    let sync = Arc::new(WppSync::new(2));
    let waiter = {
        let sync = sync.clone();
        thread::spawn(move || sync.await_ctb(0, 2))
    };
    sync.signal_abort();
    assert!(!waiter.join().unwrap());
    assert!(sync.is_aborted());
}
