//! `EmptinessUpdater` (component C9): a background task that recomputes
//! per-brick emptiness against the live transfer function or isovalue, and
//! folds the result into the shared page-table status array (ยง4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::core::types::BrickId;
use crate::format::header::BrickMeta;

use super::atlas::SharedStorage;
use super::page_table::{BI_EMPTY, BI_FLAG_COUNT, BI_MISSING};
use super::transfer_function::{TransferFunction, TF_SIZE};

/// Which rule decides whether a brick contributes nothing to the image.
#[derive(Clone, Debug)]
pub enum EmptinessMode {
    TransferFunction(TransferFunction),
    Isovalue(i64),
}

/// Is a brick with this intensity range empty under `mode`? `dataset_max_value`
/// is the header's global max, used to scale TF bucket indices into the
/// dataset's intensity domain (ยง4.6).
pub fn is_empty(mode: &EmptinessMode, min_value: i64, max_value: i64, dataset_max_value: i64) -> bool {
    match mode {
        EmptinessMode::TransferFunction(tf) => match tf.alpha_index_bounds() {
            None => true,
            Some((min_index, max_index)) => {
                let bias = dataset_max_value as f64 / (TF_SIZE - 1) as f64;
                let upper = (max_index as f64 * bias).ceil() as i64;
                let lower = (min_index as f64 * bias).floor() as i64;
                max_value < lower || min_value > upper
            }
        },
        EmptinessMode::Isovalue(iso) => *iso > max_value,
    }
}

struct Shared {
    mode: EmptinessMode,
    should_restart: bool,
}

/// Handle to the background emptiness-recomputation task. Dropping it
/// signals termination and joins the worker thread.
pub struct EmptinessUpdater {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    terminate: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EmptinessUpdater {
    pub fn spawn(
        storage: Arc<Mutex<SharedStorage>>,
        brick_metas: Arc<[BrickMeta]>,
        children: Arc<Vec<[Option<BrickId>; 8]>>,
        dataset_max_value: i64,
        initial_mode: EmptinessMode,
    ) -> Self {
        let shared = Arc::new((
            Mutex::new(Shared {
                mode: initial_mode,
                should_restart: false,
            }),
            Condvar::new(),
        ));
        let terminate = Arc::new(AtomicBool::new(false));

        let worker_shared = shared.clone();
        let worker_terminate = terminate.clone();
        let handle = thread::spawn(move || {
            run(storage, worker_shared, worker_terminate, brick_metas, children, dataset_max_value)
        });

        Self {
            shared,
            terminate,
            handle: Some(handle),
        }
    }

    /// Replace the transfer function and wake the updater.
    pub fn set_transfer_function(&self, tf: TransferFunction) {
        self.set_mode(EmptinessMode::TransferFunction(tf));
    }

    /// Replace the isovalue and wake the updater.
    pub fn set_isovalue(&self, iso: i64) {
        self.set_mode(EmptinessMode::Isovalue(iso));
    }

    fn set_mode(&self, mode: EmptinessMode) {
        let (lock, cv) = &*self.shared;
        let mut guard = lock.lock().unwrap();
        guard.mode = mode;
        guard.should_restart = true;
        cv.notify_all();
    }

    /// `VolumeAtlas::page_in` consults the live mode directly for bricks it
    /// is about to fetch, rather than waiting for the next background pass.
    pub fn current_mode_test(&self, min_value: i64, max_value: i64, dataset_max_value: i64) -> bool {
        let (lock, _) = &*self.shared;
        let guard = lock.lock().unwrap();
        is_empty(&guard.mode, min_value, max_value, dataset_max_value)
    }

    /// Called by `VolumeAtlas::page_in` once it has changed residency, so a
    /// pass already in flight recomputes against the new page table.
    pub fn notify_residents_changed(&self) {
        let (lock, cv) = &*self.shared;
        lock.lock().unwrap().should_restart = true;
        cv.notify_all();
    }
}

impl Drop for EmptinessUpdater {
    fn drop(&mut self) {
        self.terminate.store(true, Ordering::Release);
        let (_, cv) = &*self.shared;
        cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    storage: Arc<Mutex<SharedStorage>>,
    shared: Arc<(Mutex<Shared>, Condvar)>,
    terminate: Arc<AtomicBool>,
    brick_metas: Arc<[BrickMeta]>,
    children: Arc<Vec<[Option<BrickId>; 8]>>,
    dataset_max_value: i64,
) {
    let mut last_empty = vec![false; brick_metas.len()];
    let (lock, cv) = &*shared;

    loop {
        {
            let mut guard = lock.lock().unwrap();
            while !guard.should_restart && !terminate.load(Ordering::Acquire) {
                guard = cv.wait(guard).unwrap();
            }
        }
        if terminate.load(Ordering::Acquire) {
            return;
        }

        let current_empty = loop {
            let mode = {
                let mut guard = lock.lock().unwrap();
                guard.should_restart = false;
                guard.mode.clone()
            };

            let computed: Vec<bool> = brick_metas
                .iter()
                .map(|meta| is_empty(&mode, meta.min_value, meta.max_value, dataset_max_value))
                .collect();

            if lock.lock().unwrap().should_restart {
                continue;
            }
            break computed;
        };

        if current_empty == last_empty {
            continue;
        }

        apply(&storage, &current_empty, &last_empty, &children);
        last_empty = current_empty;
    }
}

fn apply(storage: &Mutex<SharedStorage>, current_empty: &[bool], last_empty: &[bool], children: &[[Option<BrickId>; 8]]) {
    let mut storage = storage.lock().unwrap();
    let brick_count = current_empty.len() as u32;

    // Pass 1: newly-empty resident bricks save their arrival index.
    for id in 0..brick_count {
        if current_empty[id as usize] == last_empty[id as usize] {
            continue;
        }
        if current_empty[id as usize] {
            if let Some(&page) = storage.brick_to_page.get(&id) {
                storage.page_meta[page as usize].flag_empty();
            }
        }
    }

    // Pass 2: status transitions, now that pass 1's flag_empty calls have
    // settled (a brick's own CHILD_EMPTY test reads its children's status).
    for id in 0..brick_count {
        if current_empty[id as usize] == last_empty[id as usize] {
            continue;
        }

        if current_empty[id as usize] {
            let all_children_empty = children.get(id as usize).is_none_or(|kids| {
                kids.iter().all(|child| match child {
                    Some(child_id) => {
                        storage.status[*child_id as usize] == super::page_table::BI_CHILD_EMPTY
                    }
                    None => true,
                })
            });
            storage.status[id as usize] = if all_children_empty {
                super::page_table::BI_CHILD_EMPTY
            } else {
                BI_EMPTY
            };
        } else if let Some(&page) = storage.brick_to_page.get(&id) {
            if storage.page_meta[page as usize].brick_id == id as i64
                && storage.page_meta[page as usize].reactivate(id)
            {
                storage.status[id as usize] = BI_FLAG_COUNT + page;
            } else {
                storage.status[id as usize] = BI_MISSING;
            }
        } else {
            storage.status[id as usize] = BI_MISSING;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_function_mode_flags_out_of_window_bricks_empty() {
        let mut entries = vec![[0u8, 0, 0, 0]; TF_SIZE];
        for e in entries.iter_mut().take(193).skip(64) {
            *e = [255, 255, 255, 255];
        }
        let tf = TransferFunction::new(entries);
        let mode = EmptinessMode::TransferFunction(tf);

        // dataset_max_value = 255, bias = 255/255 = 1.0, window is [64, 192].
        assert!(!is_empty(&mode, 0, 100, 255));
        assert!(is_empty(&mode, 0, 50, 255));
        assert!(is_empty(&mode, 200, 255, 255));
    }

    #[test]
    fn fully_transparent_tf_makes_every_brick_empty() {
        let mode = EmptinessMode::TransferFunction(TransferFunction::transparent());
        assert!(is_empty(&mode, 0, 255, 255));
    }

    #[test]
    fn isovalue_mode_empty_iff_isovalue_above_brick_max() {
        let mode = EmptinessMode::Isovalue(100);
        assert!(!is_empty(&mode, 0, 150, 255));
        assert!(is_empty(&mode, 0, 50, 255));
    }
}
