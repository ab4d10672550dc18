//! 解码进度同步.
//!
//! - [`FrameProgress`]: 帧级流水线, 参考帧按亮度行报告重建进度, 运动补偿在读取前等待.
//! - [`WppSync`]: 帧内波前 (WPP) / tile 并行, 每个 CTB 行报告已完成的 CTB 数,
//!   下一行在右上方 CTB 完成后才能开始; 共享的中止标志让所有行尽早退出.
//!
//! 错误路径总是以哨兵值 `i32::MAX` 结束进度, 保证等待方不会死锁.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

/// 进度完成哨兵
pub const PROGRESS_DONE: i32 = i32::MAX;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // 中毒时直接取回数据
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================
// 帧级进度
// ============================================================

/// 一帧的重建进度 (已完成的亮度行号)
#[derive(Debug)]
pub struct FrameProgress {
    row: Mutex<i32>,
    cond: Condvar,
}

impl Default for FrameProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameProgress {
    pub fn new() -> Self {
        Self {
            row: Mutex::new(-1),
            cond: Condvar::new(),
        }
    }

    /// 报告已完成到第 `row` 行 (单调递增, 回退的报告被忽略)
    pub fn report(&self, row: i32) {
        let mut cur = lock(&self.row);
        if row > *cur {
            *cur = row;
            self.cond.notify_all();
        }
    }

    /// 阻塞直到第 `row` 行可读, 返回当前进度
    pub fn await_row(&self, row: i32) -> i32 {
        let mut cur = lock(&self.row);
        while *cur < row {
            cur = self.cond.wait(cur).unwrap_or_else(|e| e.into_inner());
        }
        *cur
    }

    /// 当前进度 (不阻塞)
    pub fn current(&self) -> i32 {
        *lock(&self.row)
    }

    /// 整帧完成
    pub fn finish(&self) {
        self.report(PROGRESS_DONE);
    }

    /// 解码失败, 释放所有等待方
    pub fn abort(&self) {
        self.report(PROGRESS_DONE);
    }

    pub fn is_done(&self) -> bool {
        self.current() == PROGRESS_DONE
    }
}

// ============================================================
// 行级 (WPP / tile) 同步
// ============================================================

/// 帧内并行的行进度与中止标志
#[derive(Debug)]
pub struct WppSync {
    /// 每个 CTB 行已完成的 CTB 数
    rows: Mutex<Vec<i32>>,
    cond: Condvar,
    abort: AtomicBool,
}

impl WppSync {
    pub fn new(ctb_rows: usize) -> Self {
        Self {
            rows: Mutex::new(vec![0; ctb_rows]),
            cond: Condvar::new(),
            abort: AtomicBool::new(false),
        }
    }

    /// 分片段开始: 清除上一分片段的中止标志
    ///
    /// 行按解码顺序依次调度, 起始行之前的行不会再有新的进度, 一律视为完成.
    pub fn begin_segment(&self, first_row: usize) {
        self.abort.store(false, Ordering::Release);
        let mut rows = lock(&self.rows);
        for done in rows.iter_mut().take(first_row) {
            *done = PROGRESS_DONE;
        }
        self.cond.notify_all();
    }

    /// 第 `row` 行已完成 `count` 个 CTB
    pub fn report(&self, row: usize, count: i32) {
        let mut rows = lock(&self.rows);
        if let Some(cur) = rows.get_mut(row)
            && count > *cur
        {
            *cur = count;
            self.cond.notify_all();
        }
    }

    /// 第 `row` 行全部完成
    pub fn finish_row(&self, row: usize) {
        self.report(row, PROGRESS_DONE);
    }

    /// 等待第 `row` 行至少完成 `count` 个 CTB; 已中止时返回 false
    pub fn await_ctb(&self, row: usize, count: i32) -> bool {
        let mut rows = lock(&self.rows);
        loop {
            if self.abort.load(Ordering::Acquire) {
                return false;
            }
            match rows.get(row) {
                Some(&done) if done < count => {
                    rows = self.cond.wait(rows).unwrap_or_else(|e| e.into_inner());
                }
                _ => return true,
            }
        }
    }

    /// 标记致命错误并唤醒所有等待方
    pub fn signal_abort(&self) {
        self.abort.store(true, Ordering::Release);
        let _rows = lock(&self.rows);
        self.cond.notify_all();
    }

    /// 是否已中止 (每个 CTB 边界检查一次)
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}
