use std::sync::Arc;
use parking_lot::Mutex;

/// State that can absorb another instance of itself when two cells are merged
pub trait Absorb {
    fn absorb(&mut self, other: Self);
}

/// A lock-protected cell that can be merged with other cells, after which all of them refer to
///  the same state. This is a union-find structure: a merged cell forwards to the surviving cell,
///  and every access follows the forwarding chain to the root.
///
/// It is used for per-pipe state that several components share and that must be unified when
///  pipes are chained (exception queues, layer info).
#[derive(Debug)]
pub struct MergeCell<T> {
    link: Mutex<Link<T>>,
}

#[derive(Debug)]
enum Link<T> {
    Root(T),
    Forward(Arc<MergeCell<T>>),
}

impl<T: Absorb> MergeCell<T> {
    pub fn new(value: T) -> Arc<MergeCell<T>> {
        Arc::new(MergeCell {
            link: Mutex::new(Link::Root(value)),
        })
    }

    fn root(self: &Arc<Self>) -> Arc<MergeCell<T>> {
        let mut cur = self.clone();
        loop {
            let next = match &*cur.link.lock() {
                Link::Root(_) => return cur.clone(),
                Link::Forward(next) => next.clone(),
            };
            cur = next;
        }
    }

    /// Run `f` on the shared state while holding the root's lock
    pub fn with<R>(self: &Arc<Self>, f: impl FnOnce(&mut T) -> R) -> R {
        loop {
            let root = self.root();
            let mut guard = root.link.lock();
            if let Link::Root(value) = &mut *guard {
                return f(value);
            }
            // raced with a merge that forwarded this root elsewhere - retry
        }
    }

    pub fn is_same(self: &Arc<Self>, other: &Arc<Self>) -> bool {
        Arc::ptr_eq(&self.root(), &other.root())
    }

    /// Merge `other` into `self`: `self`'s root survives and absorbs the state of `other`'s root,
    ///  which then forwards to it. Merging cells that already share a root is a no-op.
    pub fn merge(self: &Arc<Self>, other: &Arc<Self>) {
        loop {
            let survivor = self.root();
            let absorbed = other.root();
            if Arc::ptr_eq(&survivor, &absorbed) {
                return;
            }

            // lock in address order to avoid deadlock with a concurrent merge in the opposite
            //  direction
            let survivor_first = Arc::as_ptr(&survivor) < Arc::as_ptr(&absorbed);
            let (mut s_guard, mut a_guard) = if survivor_first {
                let s = survivor.link.lock();
                let a = absorbed.link.lock();
                (s, a)
            }
            else {
                let a = absorbed.link.lock();
                let s = survivor.link.lock();
                (s, a)
            };

            if !matches!(&*s_guard, Link::Root(_)) || !matches!(&*a_guard, Link::Root(_)) {
                continue;
            }

            let taken = std::mem::replace(&mut *a_guard, Link::Forward(survivor.clone()));
            if let (Link::Root(target), Link::Root(value)) = (&mut *s_guard, taken) {
                target.absorb(value);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Items(Vec<u32>);
    impl Absorb for Items {
        fn absorb(&mut self, other: Self) {
            self.0.extend(other.0);
        }
    }

    #[test]
    fn test_merge_shares_state() {
        let a = MergeCell::new(Items(vec![1]));
        let b = MergeCell::new(Items(vec![2]));

        a.merge(&b);
        assert!(a.is_same(&b));

        b.with(|items| items.0.push(3));
        assert_eq!(a.with(|items| items.0.clone()), vec![1, 2, 3]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = MergeCell::new(Items(vec![1]));
        let b = MergeCell::new(Items(vec![2]));

        a.merge(&b);
        a.merge(&b);
        b.merge(&a);
        assert_eq!(a.with(|items| items.0.clone()), vec![1, 2]);
    }

    #[test]
    fn test_transitive_merge() {
        let a = MergeCell::new(Items(vec![1]));
        let b = MergeCell::new(Items(vec![2]));
        let c = MergeCell::new(Items(vec![3]));

        b.merge(&c);
        a.merge(&b);

        assert!(c.is_same(&a));
        assert_eq!(c.with(|items| items.0.len()), 3);
    }

    #[test]
    fn test_concurrent_merges() {
        let cells = (0..16).map(|i| MergeCell::new(Items(vec![i]))).collect::<Vec<_>>();

        let threads = (1..16)
            .map(|i| {
                let first = cells[if i % 2 == 0 { 0 } else { 1 }].clone();
                let other = cells[i].clone();
                std::thread::spawn(move || {
                    if i % 3 == 0 { other.merge(&first) } else { first.merge(&other) }
                })
            })
            .collect::<Vec<_>>();
        for t in threads {
            t.join().unwrap();
        }
        cells[0].merge(&cells[1]);

        let mut all = cells[7].with(|items| items.0.clone());
        all.sort();
        assert_eq!(all, (0..16).collect::<Vec<_>>());
    }
}
