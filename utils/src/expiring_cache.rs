// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A single-value holder with a TTL. A timer thread waits for the value to
//! become valid, sleeps out the remaining TTL, and invalidates it unless an
//! update touched the value in the meantime (in which case it re-arms).

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct CacheState<V> {
    value: Option<V>,
    modified_at: Option<Instant>,
    stop: bool,
}

struct CacheShared<V> {
    state: Mutex<CacheState<V>>,
    cv: Condvar,
    ttl: Duration,
}

pub struct ExpiringCache<V: Copy + Send + 'static> {
    shared: Arc<CacheShared<V>>,
    timer: Option<JoinHandle<()>>,
}

impl<V: Copy + Send + 'static> ExpiringCache<V> {
    pub fn new(ttl: Duration) -> Self {
        let shared = Arc::new(CacheShared {
            state: Mutex::new(CacheState {
                value: None,
                modified_at: None,
                stop: false,
            }),
            cv: Condvar::new(),
            ttl,
        });
        let timer_shared = shared.clone();
        let timer = std::thread::Builder::new()
            .name("expiring_cache".to_string())
            .spawn(move || Self::timer_loop(timer_shared))
            .ok();
        ExpiringCache { shared, timer }
    }

    fn timer_loop(shared: Arc<CacheShared<V>>) {
        let mut state = shared.state.lock().unwrap();
        loop {
            // Wait for the value to become valid.
            while state.value.is_none() && !state.stop {
                state = shared.cv.wait(state).unwrap();
            }
            if state.stop {
                return;
            }

            loop {
                let armed_at = match state.modified_at {
                    Some(t) => t,
                    None => break,
                };
                let elapsed = armed_at.elapsed();
                if elapsed < shared.ttl {
                    let (next, _timeout) = shared
                        .cv
                        .wait_timeout(state, shared.ttl - elapsed)
                        .unwrap();
                    state = next;
                    if state.stop {
                        return;
                    }
                    if state.value.is_none() {
                        break;
                    }
                    // Either a timeout or a spurious/update wakeup; rechecking
                    // modified_at decides whether to re-arm.
                    continue;
                }
                // TTL elapsed with no touch: expire.
                if state.modified_at == Some(armed_at) {
                    state.value = None;
                    state.modified_at = None;
                    break;
                }
            }
        }
    }

    pub fn update(&self, value: V) {
        let mut state = self.shared.state.lock().unwrap();
        state.value = Some(value);
        state.modified_at = Some(Instant::now());
        drop(state);
        self.shared.cv.notify_all();
    }

    pub fn get(&self) -> Option<V> {
        self.shared.state.lock().unwrap().value
    }
}

impl<V: Copy + Send + 'static> Drop for ExpiringCache<V> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
        }
        self.shared.cv.notify_all();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_invalid() {
        let cache: ExpiringCache<u64> = ExpiringCache::new(Duration::from_millis(50));
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn test_expires_after_ttl() {
        let cache = ExpiringCache::new(Duration::from_millis(30));
        cache.update(7u64);
        assert_eq!(cache.get(), Some(7));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn test_update_rearms_ttl() {
        let cache = ExpiringCache::new(Duration::from_millis(80));
        cache.update(1u64);
        std::thread::sleep(Duration::from_millis(50));
        cache.update(2u64);
        std::thread::sleep(Duration::from_millis(50));
        // 100 ms after the first update but only 50 ms after the touch.
        assert_eq!(cache.get(), Some(2));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get(), None);
    }
}
