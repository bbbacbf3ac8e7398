//! `CachingRemoteDataSource` (ยง4.4): serves bricks from a local mirror file,
//! populating that mirror from a `RemoteDataSource` via a background worker.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use memmap2::MmapMut;

use super::cache_map::CacheMap;
use super::remote::RemoteDataSource;
use super::DataSource;
use crate::core::error::{Error, Result};
use crate::format::compression::{decompress_brick, Compression};
use crate::format::header::{write_metadata_block, BrickFileHeader, BrickMeta};

struct CacheState {
    map: CacheMap,
    /// `None` only in the brief window between taking it for `finalize`
    /// and remapping the renamed target file.
    mmap: Option<MmapMut>,
}

struct Inner {
    queue: Mutex<VecDeque<u32>>,
    queue_cv: Condvar,
    cache: Mutex<CacheState>,
    cache_cv: Condvar,
    terminate: AtomicBool,
    caching_complete: AtomicBool,
}

/// Mirrors a remote dataset to a local file, serving resident bricks from
/// the mirror and fetching the rest through a single background worker.
pub struct CachingRemoteDataSource {
    remote: Arc<RemoteDataSource>,
    inner: Arc<Inner>,
    incomplete_path: PathBuf,
    target_path: PathBuf,
    cache_map_path: PathBuf,
    /// If true, `brick()` blocks the caller until the fetch completes
    /// instead of returning `NotYetAvailable` (ยง4.4, ยง12 open-question
    /// resolution: kept as a constructor flag rather than a second type).
    blocking: bool,
    worker: Option<JoinHandle<()>>,
}

impl CachingRemoteDataSource {
    /// `local_dir`/`name` determine the mirror's three on-disk paths:
    /// `name.borgvr` (complete), `name.borgvr.incomplete` (in progress),
    /// `name.borgvr.cachemap` (resumable bitmap).
    pub fn new(remote: RemoteDataSource, local_dir: impl AsRef<Path>, name: &str, blocking: bool) -> Result<Self> {
        let remote = Arc::new(remote);
        let target_path = local_dir.as_ref().join(format!("{name}.borgvr"));
        let incomplete_path = local_dir.as_ref().join(format!("{name}.borgvr.incomplete"));
        let cache_map_path = local_dir.as_ref().join(format!("{name}.borgvr.cachemap"));

        let brick_count = remote.brick_count();
        let last = remote.brick_meta(brick_count - 1)?;
        let total_len = last.offset + last.size;

        let (map, mmap, already_complete) = if target_path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&target_path)?;
            let mmap = unsafe { MmapMut::map_mut(&file)? };
            let mut map = CacheMap::new(brick_count);
            for id in 0..brick_count {
                map.set(id);
            }
            (map, mmap, true)
        } else if incomplete_path.exists() && cache_map_path.exists() {
            let map = CacheMap::load(&cache_map_path)?;
            let file = OpenOptions::new().read(true).write(true).open(&incomplete_path)?;
            let mmap = unsafe { MmapMut::map_mut(&file)? };
            (map, mmap, false)
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&incomplete_path)?;
            file.set_len(total_len)?;
            let mmap = unsafe { MmapMut::map_mut(&file)? };
            (CacheMap::new(brick_count), mmap, false)
        };

        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            cache: Mutex::new(CacheState { map, mmap: Some(mmap) }),
            cache_cv: Condvar::new(),
            terminate: AtomicBool::new(false),
            caching_complete: AtomicBool::new(already_complete),
        });

        let worker = {
            let inner = inner.clone();
            let remote = remote.clone();
            let incomplete_path = incomplete_path.clone();
            let target_path = target_path.clone();
            let cache_map_path = cache_map_path.clone();
            thread::spawn(move || worker_loop(&inner, &remote, &incomplete_path, &target_path, &cache_map_path))
        };

        Ok(Self {
            remote,
            inner,
            incomplete_path,
            target_path,
            cache_map_path,
            blocking,
            worker: Some(worker),
        })
    }

    fn enqueue(&self, id: u32) {
        let mut queue = self.inner.queue.lock().unwrap();
        if !queue.contains(&id) {
            queue.push_back(id);
        }
        self.inner.queue_cv.notify_one();
    }

    fn decode_local(&self, cache: &CacheState, id: u32, out: &mut Vec<u8>) -> Result<()> {
        let meta = self.remote.brick_meta(id)?;
        let start = meta.offset as usize;
        let end = start + meta.size as usize;
        let mmap = cache.mmap.as_ref().expect("mmap present while not finalizing");
        let raw = &mmap[start..end];

        let header = self.remote.metadata();
        let full = header.full_brick_bytes();
        let compression = Compression::from_flag(header.compressed);
        if compression.as_flag() && (meta.size as usize) < full {
            *out = decompress_brick(raw, full)?;
        } else {
            out.clear();
            out.extend_from_slice(raw);
            if out.len() != full {
                return Err(Error::DecompressedSizeMismatch {
                    expected: full,
                    actual: out.len(),
                });
            }
        }
        Ok(())
    }

    /// Fetch `id` directly (bypassing the request queue) and store it in
    /// the mirror, then decode. Used for `first_brick`, which must succeed
    /// synchronously regardless of `blocking`.
    fn fetch_now(&self, id: u32, out: &mut Vec<u8>) -> Result<()> {
        let raw = self.remote.fetch_raw(id)?;
        let meta = *self.remote.brick_meta(id)?;
        {
            let mut cache = self.inner.cache.lock().unwrap();
            let start = meta.offset as usize;
            let end = start + raw.len();
            cache
                .mmap
                .as_mut()
                .expect("mmap present while not finalizing")[start..end]
                .copy_from_slice(&raw);
            cache.map.set(id);
        }
        self.inner.cache_cv.notify_all();
        let cache = self.inner.cache.lock().unwrap();
        self.decode_local(&cache, id, out)
    }
}

impl DataSource for CachingRemoteDataSource {
    fn metadata(&self) -> &BrickFileHeader {
        self.remote.metadata()
    }

    fn first_brick(&self, out: &mut Vec<u8>) -> Result<()> {
        let id = self.metadata().total_bricks() - 1;
        {
            let cache = self.inner.cache.lock().unwrap();
            if cache.map.is_set(id) {
                return self.decode_local(&cache, id, out);
            }
        }
        self.fetch_now(id, out)
    }

    fn brick(&self, id: u32, out: &mut Vec<u8>) -> Result<()> {
        {
            let cache = self.inner.cache.lock().unwrap();
            if cache.map.is_set(id) {
                return self.decode_local(&cache, id, out);
            }
        }

        self.enqueue(id);

        if self.blocking {
            let mut cache = self.inner.cache.lock().unwrap();
            while !cache.map.is_set(id) && !self.inner.terminate.load(Ordering::Acquire) {
                cache = self.inner.cache_cv.wait(cache).unwrap();
            }
            if cache.map.is_set(id) {
                return self.decode_local(&cache, id, out);
            }
            return Err(Error::NotYetAvailable(id));
        }

        Err(Error::NotYetAvailable(id))
    }

    fn new_request(&self) {
        let mut queue = self.inner.queue.lock().unwrap();
        queue.clear();
    }
}

impl Drop for CachingRemoteDataSource {
    fn drop(&mut self) {
        self.inner.terminate.store(true, Ordering::Release);
        self.inner.queue_cv.notify_all();
        self.inner.cache_cv.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if !self.inner.caching_complete.load(Ordering::Acquire) {
            let cache = self.inner.cache.lock().unwrap();
            if let Err(e) = cache.map.save(&self.cache_map_path) {
                log::warn!("failed to persist cache map on shutdown: {e}");
            }
        }
    }
}

fn worker_loop(inner: &Inner, remote: &RemoteDataSource, incomplete_path: &Path, target_path: &Path, cache_map_path: &Path) {
    loop {
        if inner.terminate.load(Ordering::Acquire) {
            return;
        }

        let id = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if inner.terminate.load(Ordering::Acquire) {
                    return;
                }
                if let Some(id) = queue.pop_front() {
                    break Some(id);
                }
                if inner.caching_complete.load(Ordering::Acquire) {
                    let (q, _) = inner
                        .queue_cv
                        .wait_timeout(queue, Duration::from_millis(200))
                        .unwrap();
                    queue = q;
                    continue;
                }
                let prefetch = inner.cache.lock().unwrap().map.last_unset_index();
                match prefetch {
                    Some(id) => break Some(id),
                    None => continue, // became complete concurrently
                }
            }
        };

        let Some(id) = id else { continue };

        let already_resident = inner.cache.lock().unwrap().map.is_set(id);
        if already_resident {
            continue;
        }

        match remote.fetch_raw(id) {
            Ok(raw) => {
                let Ok(meta) = remote.brick_meta(id) else {
                    continue;
                };
                let meta = *meta;
                let complete = {
                    let mut cache = inner.cache.lock().unwrap();
                    let start = meta.offset as usize;
                    let end = start + raw.len();
                    match cache.mmap.as_mut() {
                        Some(mmap) if end <= mmap.len() => {
                            mmap[start..end].copy_from_slice(&raw);
                            cache.map.set(id);
                            cache.map.is_complete()
                        }
                        _ => false,
                    }
                };
                inner.cache_cv.notify_all();
                if complete {
                    if let Err(e) = finalize(inner, remote, incomplete_path, target_path, cache_map_path) {
                        log::error!("failed to finalize cache mirror: {e}");
                    }
                }
            }
            Err(e) => {
                // ยง7: cache worker errors are logged and retried on next
                // request; they never flip `cachingComplete`.
                log::warn!("cache worker failed to fetch brick {id}: {e}");
            }
        }
    }
}

fn finalize(inner: &Inner, remote: &RemoteDataSource, incomplete_path: &Path, target_path: &Path, cache_map_path: &Path) -> Result<()> {
    {
        let mut cache = inner.cache.lock().unwrap();
        if let Some(mmap) = cache.mmap.take() {
            mmap.flush()?;
        }
    }

    let mut header = remote.metadata().clone();
    header.description = format!("Local copy of {}", header.description);
    let bricks: Vec<BrickMeta> = (0..remote.brick_count())
        .map(|id| *remote.brick_meta(id).expect("id in range"))
        .collect();
    let metadata = write_metadata_block(&header, &bricks);
    let metadata_offset = bricks.last().map(|b| b.offset + b.size).unwrap_or(8);

    {
        let mut file = OpenOptions::new().write(true).open(incomplete_path)?;
        file.set_len(metadata_offset)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&metadata_offset.to_le_bytes())?;
        file.seek(SeekFrom::Start(metadata_offset))?;
        file.write_all(&metadata)?;
        file.flush()?;
    }

    fs::rename(incomplete_path, target_path)?;
    let _ = fs::remove_file(cache_map_path);

    let file = OpenOptions::new().read(true).write(true).open(target_path)?;
    let mmap = unsafe { MmapMut::map_mut(&file)? };
    inner.cache.lock().unwrap().mmap = Some(mmap);

    inner.caching_complete.store(true, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bricker::volume_reader::InMemoryVolumeReader;
    use crate::bricker::{self, BrickerConfig, ExtensionStrategyConfig};
    use crate::format::reader::BrickFile;
    use crate::source::server::Server;
    use std::net::TcpListener;

    fn start_server(dir: &Path) -> std::net::SocketAddr {
        let dims = (8u32, 8u32, 8u32);
        let data = vec![11u8; 512];
        let reader = InMemoryVolumeReader::new(data, dims, 1, 1);
        let path = dir.join("served.borgvr");
        bricker::run(
            &reader,
            &BrickerConfig {
                brick_size: 4,
                overlap: 0,
                extension_strategy: ExtensionStrategyConfig::Clamp,
                compression: false,
                description: "caching test".into(),
            },
            &path,
        )
        .unwrap();
        let file = BrickFile::open(&path).unwrap();

        let mut server = Server::new();
        server.add_dataset(0, "Foo", file);
        let server = Arc::new(server);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let addr_string = addr.to_string();
        thread::spawn(move || {
            let _ = server.serve(addr_string.as_str());
        });
        thread::sleep(Duration::from_millis(50));
        addr
    }

    #[test]
    fn blocking_fetch_populates_and_completes_the_mirror() {
        let server_dir = tempfile::tempdir().unwrap();
        let addr = start_server(server_dir.path());

        let local_dir = tempfile::tempdir().unwrap();
        let remote = RemoteDataSource::connect(&addr.to_string(), 0).unwrap();
        let brick_count = remote.brick_count();
        let source = CachingRemoteDataSource::new(remote, local_dir.path(), "mirror", true).unwrap();

        let mut buf = Vec::new();
        source.first_brick(&mut buf).unwrap();
        assert_eq!(buf.len(), source.metadata().full_brick_bytes());

        for id in 0..brick_count {
            source.brick(id, &mut buf).unwrap();
            assert_eq!(buf.len(), source.metadata().full_brick_bytes());
        }

        // Give the background worker a chance to notice the mirror is
        // complete and finalize the rename.
        thread::sleep(Duration::from_millis(100));
        assert!(local_dir.path().join("mirror.borgvr").exists());
    }

    #[test]
    fn nonblocking_fetch_reports_not_yet_available_then_resolves() {
        let server_dir = tempfile::tempdir().unwrap();
        let addr = start_server(server_dir.path());

        let local_dir = tempfile::tempdir().unwrap();
        let remote = RemoteDataSource::connect(&addr.to_string(), 0).unwrap();
        let source = CachingRemoteDataSource::new(remote, local_dir.path(), "mirror", false).unwrap();

        let mut buf = Vec::new();
        let first_attempt = source.brick(0, &mut buf);
        assert!(matches!(first_attempt, Err(Error::NotYetAvailable(0)) | Ok(())));

        // Poll until the worker resolves it.
        for _ in 0..50 {
            if source.brick(0, &mut buf).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("brick 0 never became available");
    }
}
