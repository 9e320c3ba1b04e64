//! Watched descriptor set.

use nix::poll::PollFlags;
use std::collections::BTreeMap;
use std::os::fd::RawFd;

/// Readiness classes a descriptor may be watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
    pub except: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
        except: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
        except: false,
    };
    pub const EXCEPT: Interest = Interest {
        read: false,
        write: false,
        except: true,
    };

    pub fn is_empty(self) -> bool {
        !(self.read || self.write || self.except)
    }

    fn union(self, other: Interest) -> Interest {
        Interest {
            read: self.read || other.read,
            write: self.write || other.write,
            except: self.except || other.except,
        }
    }

    fn without(self, other: Interest) -> Interest {
        Interest {
            read: self.read && !other.read,
            write: self.write && !other.write,
            except: self.except && !other.except,
        }
    }

    pub(crate) fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.read {
            flags |= PollFlags::POLLIN;
        }
        if self.write {
            flags |= PollFlags::POLLOUT;
        }
        if self.except {
            flags |= PollFlags::POLLPRI;
        }
        flags
    }
}

/// Descriptors the loop multiplexes, with the highest one tracked.
#[derive(Debug, Default)]
pub struct WatchSet {
    fds: BTreeMap<RawFd, Interest>,
    hfd: RawFd,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `interest` for `fd`. Watching twice is a no-op.
    pub fn watch(&mut self, fd: RawFd, interest: Interest) {
        if interest.is_empty() {
            return;
        }
        let entry = self.fds.entry(fd).or_default();
        *entry = entry.union(interest);
        if fd > self.hfd {
            self.hfd = fd;
        }
    }

    /// Drop `interest` for `fd`. Unwatching an unwatched fd is a no-op.
    pub fn unwatch(&mut self, fd: RawFd, interest: Interest) {
        let Some(current) = self.fds.get(&fd).copied() else {
            return;
        };
        let remaining = current.without(interest);
        if remaining.is_empty() {
            self.fds.remove(&fd);
        } else {
            self.fds.insert(fd, remaining);
        }
        if fd == self.hfd {
            self.recompute_hfd();
        }
    }

    /// Scan down from the previous maximum for the next watched fd.
    fn recompute_hfd(&mut self) {
        let mut fd = self.hfd;
        while fd > 0 && !self.fds.contains_key(&fd) {
            fd -= 1;
        }
        self.hfd = fd;
    }

    /// Highest watched descriptor, or 0.
    pub fn hfd(&self) -> RawFd {
        self.hfd
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.fds.get(&fd).copied()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Snapshot of every watched fd in ascending order.
    pub fn snapshot(&self) -> Vec<(RawFd, Interest)> {
        self.fds.iter().map(|(&fd, &i)| (fd, i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hfd_tracks_highest_watched() {
        let mut set = WatchSet::new();
        assert_eq!(set.hfd(), 0);

        set.watch(5, Interest::READ);
        set.watch(9, Interest::READ);
        set.watch(7, Interest::WRITE);
        assert_eq!(set.hfd(), 9);

        set.unwatch(9, Interest::READ);
        assert_eq!(set.hfd(), 7);
        set.unwatch(7, Interest::WRITE);
        assert_eq!(set.hfd(), 5);
        set.unwatch(5, Interest::READ);
        assert_eq!(set.hfd(), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn watch_and_unwatch_are_idempotent() {
        let mut set = WatchSet::new();
        set.watch(4, Interest::READ);
        set.watch(4, Interest::READ);
        assert_eq!(set.len(), 1);
        assert_eq!(set.interest(4), Some(Interest::READ));

        set.unwatch(4, Interest::READ);
        set.unwatch(4, Interest::READ);
        set.unwatch(11, Interest::READ);
        assert!(!set.contains(4));
        assert_eq!(set.hfd(), 0);
    }

    #[test]
    fn interests_accumulate_per_fd() {
        let mut set = WatchSet::new();
        set.watch(3, Interest::READ);
        set.watch(3, Interest::EXCEPT);
        assert_eq!(
            set.interest(3),
            Some(Interest {
                read: true,
                write: false,
                except: true
            })
        );

        set.unwatch(3, Interest::READ);
        assert_eq!(set.interest(3), Some(Interest::EXCEPT));
        assert_eq!(set.hfd(), 3);
    }

    #[test]
    fn lower_fd_removal_keeps_hfd() {
        let mut set = WatchSet::new();
        set.watch(3, Interest::READ);
        set.watch(8, Interest::READ);
        set.unwatch(3, Interest::READ);
        assert_eq!(set.hfd(), 8);
    }

    #[test]
    fn snapshot_is_ascending() {
        let mut set = WatchSet::new();
        for fd in [12, 4, 8] {
            set.watch(fd, Interest::READ);
        }
        let fds: Vec<_> = set.snapshot().into_iter().map(|(fd, _)| fd).collect();
        assert_eq!(fds, vec![4, 8, 12]);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// After any sequence of watch/unwatch calls, hfd equals the highest
        /// fd with a non-empty interest, or 0.
        #[test]
        fn hfd_matches_highest_registered(
            ops in prop::collection::vec((any::<bool>(), 0i32..64, 0u8..3), 0..200)
        ) {
            let mut set = WatchSet::new();
            for (add, fd, class) in ops {
                let interest = match class {
                    0 => Interest::READ,
                    1 => Interest::WRITE,
                    _ => Interest::EXCEPT,
                };
                if add {
                    set.watch(fd, interest);
                } else {
                    set.unwatch(fd, interest);
                }
                let expected = set.snapshot().last().map(|(fd, _)| *fd).unwrap_or(0);
                prop_assert_eq!(set.hfd(), expected);
            }
        }
    }
}
