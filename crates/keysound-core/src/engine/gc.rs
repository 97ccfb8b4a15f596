//! Collector thread behind every `Shared<CachedAsset>`
//!
//! `CacheManager` wraps each decoded asset with [`gc_handle`]. Clones travel
//! into voices through their `AssetReader`, so after `CacheManager::clear` the
//! last clone usually belongs to a voice. The mixer hands finished voices back
//! through its retired queue and `VoicePool::release` closes the reader on
//! the control thread, which is where that clone ends. Either way the drop
//! only pushes the pointer onto the `keysound-gc` queue and the PCM block is
//! freed there within `COLLECT_INTERVAL`, so a free never blocks `maintain`
//! or, if a voice is ever dropped inside the mixer, the audio callback.

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Collection interval of the background thread
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn start_collector() -> Handle {
    let (tx, rx) = mpsc::channel();

    // The Collector is !Sync, so it is created on and never leaves its thread
    thread::Builder::new()
        .name("keysound-gc".to_string())
        .spawn(move || {
            let mut collector = Collector::new();
            tx.send(collector.handle()).expect("GC handle receiver dropped");

            log::info!("Keysound GC thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        })
        .expect("Failed to spawn keysound GC thread");

    rx.recv().expect("GC thread exited before sending its handle")
}

/// Handle for creating `Shared<T>` allocations; starts the collector on first use
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(start_collector).clone()
}
