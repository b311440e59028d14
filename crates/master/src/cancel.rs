//! 停止标记
//!
//! 进程级的协作式取消令牌，经构造函数注入 DAG 引擎、任务监督器与
//! 集群控制器；各循环在各自的轮询点检查并安静退出。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct StopFlag {
    stopped: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_shared_across_clones() {
        let flag = StopFlag::new();
        let cloned = flag.clone();
        assert!(flag.is_running());

        cloned.stop();
        assert!(flag.is_stopped());
        assert!(!flag.is_running());
    }
}
