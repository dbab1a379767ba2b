use std::sync::atomic::{AtomicBool, Ordering};

/// A one-shot 'done' marker. `set()` returns `true` for exactly one caller, which is the one
///  that gets to run the guarded action (disconnect, dispose, ...).
#[derive(Debug, Default)]
pub struct OnceFlag {
    done: AtomicBool,
}

impl OnceFlag {
    pub const fn new() -> OnceFlag {
        OnceFlag {
            done: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn set(&self) -> bool {
        self.done.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use super::*;

    #[test]
    fn test_set_once() {
        let flag = OnceFlag::new();
        assert!(!flag.is_set());
        assert!(flag.set());
        assert!(!flag.set());
        assert!(flag.is_set());
    }

    #[test]
    fn test_concurrent_set_has_single_winner() {
        let flag = Arc::new(OnceFlag::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let threads = (0..8)
            .map(|_| {
                let flag = flag.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if flag.set() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
