//! Engine composition root
//!
//! [`KeysoundEngine::new`] splits the engine in two halves:
//!
//! - [`KeysoundEngine`]: control side, shared by reference between any number
//!   of threads. Resolves assets through the cache, arms pooled voices and
//!   queues them on a bus.
//! - [`AudioRenderer`]: moved into the host audio callback. Owns both mixing
//!   graphs, the scratch buffers and the limiter.
//!
//! ```text
//! effects graph × effects volume ─┐
//!                                 ├─► × master volume ─► limiter ─► host buffer
//! music graph   × music volume  ──┘
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use basedrop::Shared;

use super::looping::LoopManager;
use super::mixer::{MixerHandle, MixerInput, MixingGraph};
use super::pool::VoicePool;
use super::voice::{Voice, VoiceControl, VoiceId, VoiceParams};
use crate::asset::{CachedAsset, RealtimeScope};
use crate::cache::CacheManager;
use crate::config::EngineConfig;
use crate::dsp::LookaheadLimiter;
use crate::types::{frames_mut, AtomicF32, WaveFormat};

/// Bus volumes shared with the renderer
#[derive(Debug)]
struct BusVolumes {
    master: AtomicF32,
    effects: AtomicF32,
    music: AtomicF32,
}

type VoiceHandle = MixerHandle<Box<Voice>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bus {
    Effects,
    Music,
}

/// Control side of the engine
pub struct KeysoundEngine {
    config: EngineConfig,
    cache: Arc<CacheManager>,
    pool: VoicePool,
    loops: LoopManager,
    effects: VoiceHandle,
    music: VoiceHandle,
    music_voice: Mutex<Option<VoiceId>>,
    /// Removals refused by a full queue, retried by `maintain`
    deferred_removals: Mutex<Vec<(Bus, VoiceId)>>,
    volumes: Arc<BusVolumes>,
}

/// Real-time side of the engine
pub struct AudioRenderer {
    effects: MixingGraph<Box<Voice>>,
    music: MixingGraph<Box<Voice>>,
    music_scratch: Vec<f32>,
    limiter: Option<LookaheadLimiter>,
    volumes: Arc<BusVolumes>,
}

impl KeysoundEngine {
    pub fn new(config: EngineConfig) -> (Self, AudioRenderer) {
        let max_samples = config.max_buffer_samples();
        let format = config.wave_format();

        let (effects_graph, effects) =
            MixingGraph::new(config.max_voices, max_samples, config.read_fully);
        let (music_graph, music) =
            MixingGraph::new(config.music_max_voices, max_samples, config.read_fully);

        let volumes = Arc::new(BusVolumes {
            master: AtomicF32::new(config.master_volume),
            effects: AtomicF32::new(config.effects_volume),
            music: AtomicF32::new(config.music_volume),
        });

        let limiter = config
            .limiter
            .enabled
            .then(|| LookaheadLimiter::new(&config.limiter, config.sample_rate));

        if config.channels != format.channels {
            log::warn!(
                "Engine mixes stereo; ignoring configured channel count {}",
                config.channels
            );
        }

        log::info!(
            "Keysound engine: {} Hz, {} effect voices, {} music voices, limiter {}",
            config.sample_rate,
            config.max_voices,
            config.music_max_voices,
            if limiter.is_some() { "on" } else { "off" }
        );

        let renderer = AudioRenderer {
            effects: effects_graph,
            music: music_graph,
            music_scratch: vec![0.0; max_samples],
            limiter,
            volumes: Arc::clone(&volumes),
        };

        let engine = Self {
            cache: Arc::new(CacheManager::new(format)),
            pool: VoicePool::new(config.voice_pool_size, &config.balance, config.sample_rate),
            loops: LoopManager::new(),
            effects,
            music,
            music_voice: Mutex::new(None),
            deferred_removals: Mutex::new(Vec::new()),
            volumes,
            config,
        };

        (engine, renderer)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn format(&self) -> WaveFormat {
        self.cache.format()
    }

    /// The decode cache feeding this engine
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    fn bus(&self, bus: Bus) -> &VoiceHandle {
        match bus {
            Bus::Effects => &self.effects,
            Bus::Music => &self.music,
        }
    }

    /// Queue removal of `id`, keeping it for `maintain` if the queue is full
    fn remove_voice(&self, bus: Bus, id: VoiceId) {
        if !self.bus(bus).remove(id) {
            log::debug!("Removal queue full, deferring stop of voice {}", id.as_u64());
            self.deferred_removals
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((bus, id));
        }
    }

    fn start(
        &self,
        bus: &VoiceHandle,
        asset: &Shared<CachedAsset>,
        params: VoiceParams,
    ) -> Option<(VoiceId, Arc<VoiceControl>)> {
        let voice = self.pool.acquire(asset.clone(), params);
        let id = voice.id();
        let control = voice.control();
        match bus.try_add(voice) {
            Ok(()) => Some((id, control)),
            Err(voice) => {
                log::warn!(
                    "Voice limit reached ({} voices), dropping trigger for {}",
                    bus.max_voices(),
                    asset.hash()
                );
                self.pool.release(voice);
                None
            }
        }
    }

    /// Play `asset` once on the effects bus
    pub fn play(&self, asset: &Shared<CachedAsset>, volume: f32, balance: f32) -> Option<VoiceId> {
        let params = VoiceParams {
            volume,
            balance,
            looping: false,
        };
        self.start(&self.effects, asset, params).map(|(id, _)| id)
    }

    /// Loop `asset` on `channel` until [`stop_looped`](Self::stop_looped),
    /// replacing whatever looped there before
    pub fn play_looped(
        &self,
        asset: &Shared<CachedAsset>,
        channel: u32,
        volume: f32,
    ) -> Option<VoiceId> {
        let params = VoiceParams {
            volume,
            balance: 0.0,
            looping: true,
        };
        let (id, control) = self.start(&self.effects, asset, params)?;
        if let Some(previous) = self.loops.register(channel, id, control) {
            self.remove_voice(Bus::Effects, previous);
        }
        Some(id)
    }

    /// Stop the loop on `channel`; false if nothing was looping there
    pub fn stop_looped(&self, channel: u32) -> bool {
        match self.loops.take(channel) {
            Some(id) => {
                self.remove_voice(Bus::Effects, id);
                true
            }
            None => false,
        }
    }

    pub fn set_loop_volume(&self, channel: u32, volume: f32) -> bool {
        self.loops.set_volume(channel, volume)
    }

    /// Replace the music track
    pub fn play_music(&self, asset: &Shared<CachedAsset>, volume: f32) -> Option<VoiceId> {
        let mut current = self.music_voice.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.take() {
            self.remove_voice(Bus::Music, previous);
        }
        let params = VoiceParams {
            volume,
            balance: 0.0,
            looping: false,
        };
        let id = self.start(&self.music, asset, params).map(|(id, _)| id);
        *current = id;
        id
    }

    pub fn stop_music(&self) {
        let mut current = self.music_voice.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = current.take() {
            self.remove_voice(Bus::Music, id);
        }
    }

    /// Silence everything on both buses
    pub fn stop_all(&self) {
        self.loops.drain();
        *self.music_voice.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.deferred_removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.effects.clear();
        self.music.clear();
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.volumes.master.store(volume.max(0.0));
    }

    pub fn set_effects_volume(&self, volume: f32) {
        self.volumes.effects.store(volume.max(0.0));
    }

    pub fn set_music_volume(&self, volume: f32) {
        self.volumes.music.store(volume.max(0.0));
    }

    pub fn master_volume(&self) -> f32 {
        self.volumes.master.load()
    }

    /// Voices playing as of the last callback (both buses)
    pub fn active_voices(&self) -> usize {
        self.effects.active_count() + self.music.active_count()
    }

    /// Recycle voices the renderer retired and re-queue deferred removals;
    /// call periodically off the audio thread
    pub fn maintain(&self) -> usize {
        {
            let mut deferred = self
                .deferred_removals
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            deferred.retain(|&(bus, id)| !self.bus(bus).remove(id));
        }
        self.pool.reclaim(&self.effects) + self.pool.reclaim(&self.music)
    }

    /// Removals waiting for room in a removal queue
    pub fn deferred_removals(&self) -> usize {
        self.deferred_removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn idle_voices(&self) -> usize {
        self.pool.available()
    }
}

impl AudioRenderer {
    /// Fill `out` (interleaved stereo) with the next block of the mix
    ///
    /// Returns the number of samples written, always `out.len()`.
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        let _rt = RealtimeScope::enter();

        let block = self.music_scratch.len();
        for chunk in out.chunks_mut(block) {
            self.render_block(chunk);
        }
        out.len()
    }

    fn render_block(&mut self, out: &mut [f32]) {
        let len = out.len();
        let master = self.volumes.master.load();
        let effects = self.volumes.effects.load();
        let music = self.volumes.music.load();

        self.effects.read(out);
        let music_buf = &mut self.music_scratch[..len];
        self.music.read(music_buf);

        for (o, m) in out.iter_mut().zip(music_buf.iter()) {
            *o = (*o * effects + *m * music) * master;
        }

        if let Some(limiter) = self.limiter.as_mut() {
            limiter.process(frames_mut(out));
        }
    }

    /// Limiter latency in frames (0 when disabled)
    pub fn latency_frames(&self) -> usize {
        self.limiter.as_ref().map_or(0, |l| l.latency_frames())
    }

    /// Current limiter gain (1.0 when disabled or idle)
    pub fn limiter_gain(&self) -> f32 {
        self.limiter.as_ref().map_or(1.0, |l| l.current_gain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStatus, DEFAULT_CATEGORY};
    use crate::test_util::wav_bytes;

    fn make_engine(limiter: bool) -> (KeysoundEngine, AudioRenderer) {
        let mut config = EngineConfig::default();
        config.max_buffer_frames = 256;
        config.limiter.enabled = limiter;
        config.balance.mode = crate::dsp::BalanceMode::Off;
        KeysoundEngine::new(config)
    }

    /// Constant-value stereo clip at the engine rate
    fn load(engine: &KeysoundEngine, key: &str, value: i16, frames: usize) -> Shared<CachedAsset> {
        let bytes = wav_bytes(48000, 2, frames, |_, _| value);
        let result = engine.cache().try_get_or_create(key, bytes, DEFAULT_CATEGORY).unwrap();
        assert_ne!(result.status, CacheStatus::Failed);
        result.asset.unwrap()
    }

    #[test]
    fn test_silence_without_voices() {
        let (_engine, mut renderer) = make_engine(true);
        let mut out = vec![1.0; 512];
        assert_eq!(renderer.render(&mut out), 512);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_play_mixes_and_recycles() {
        let (engine, mut renderer) = make_engine(false);
        let asset = load(&engine, "tick", 8192, 100);

        assert!(engine.play(&asset, 1.0, 0.0).is_some());
        assert!(engine.play(&asset, 0.5, 0.0).is_some());

        let mut out = vec![0.0; 512];
        renderer.render(&mut out);

        // 0.25 + 0.125 for the 100 frames the clip lasts
        assert!((out[0] - 0.375).abs() < 1e-6);
        assert!((out[199] - 0.375).abs() < 1e-6);
        assert_eq!(out[200], 0.0);

        let idle_before = engine.idle_voices();
        assert_eq!(engine.maintain(), 2);
        assert_eq!(engine.idle_voices(), idle_before + 2);
    }

    #[test]
    fn test_bus_volumes() {
        let (engine, mut renderer) = make_engine(false);
        let fx = load(&engine, "fx", 16384, 1000);
        let song = load(&engine, "song", 8192, 1000);

        engine.play(&fx, 1.0, 0.0);
        engine.play_music(&song, 1.0);
        engine.set_effects_volume(0.5);
        engine.set_music_volume(2.0);
        engine.set_master_volume(0.5);

        let mut out = vec![0.0; 64];
        renderer.render(&mut out);
        // (0.5 × 0.5 + 0.25 × 2.0) × 0.5
        assert!((out[10] - 0.375).abs() < 1e-6, "got {}", out[10]);
    }

    #[test]
    fn test_looped_voice_until_stopped() {
        let (engine, mut renderer) = make_engine(false);
        let asset = load(&engine, "hum", 3277, 10);

        engine.play_looped(&asset, 1, 1.0).unwrap();
        let mut out = vec![0.0; 1024];
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| (s - 0.1).abs() < 1e-3));
        assert_eq!(engine.active_voices(), 1);

        assert!(engine.set_loop_volume(1, 0.0));
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));

        assert!(engine.stop_looped(1));
        assert!(!engine.stop_looped(1));
        renderer.render(&mut out);
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_looped_channel_replaces_voice() {
        let (engine, mut renderer) = make_engine(false);
        let low = load(&engine, "low", 3277, 10);
        let high = load(&engine, "high", 6554, 10);

        engine.play_looped(&low, 4, 1.0).unwrap();
        let mut out = vec![0.0; 64];
        renderer.render(&mut out);
        engine.play_looped(&high, 4, 1.0).unwrap();
        renderer.render(&mut out);

        assert_eq!(engine.active_voices(), 1);
        assert!(out.iter().all(|&s| (s - 0.2).abs() < 1e-3));
    }

    #[test]
    fn test_limiter_holds_ceiling() {
        let (engine, mut renderer) = make_engine(true);
        let asset = load(&engine, "loud", 30000, 4800);
        for _ in 0..4 {
            engine.play(&asset, 1.0, 0.0);
        }

        let ceiling = engine.config().limiter.ceiling();
        let mut out = vec![0.0; 512];
        for _ in 0..10 {
            renderer.render(&mut out);
            assert!(out.iter().all(|s| s.abs() <= ceiling));
        }
        assert!(renderer.limiter_gain() < 0.5);
    }

    #[test]
    fn test_stop_all_and_clear_cache() {
        let (engine, mut renderer) = make_engine(false);
        let asset = load(&engine, "clap", 1000, 10_000);
        engine.play(&asset, 1.0, 0.0);
        engine.play_looped(&asset, 2, 1.0);

        let mut out = vec![0.0; 128];
        renderer.render(&mut out);
        assert_eq!(engine.active_voices(), 2);

        engine.stop_all();
        renderer.render(&mut out);
        assert_eq!(engine.active_voices(), 0);
        assert!(out.iter().all(|&s| s == 0.0));

        engine.maintain();
        engine.cache().clear(DEFAULT_CATEGORY);
        assert!(asset.is_disposed());
    }

    #[test]
    fn test_stop_survives_full_removal_queue() {
        let mut config = EngineConfig::default();
        config.max_voices = 2;
        config.balance.mode = crate::dsp::BalanceMode::Off;
        let (engine, mut renderer) = KeysoundEngine::new(config);
        let asset = load(&engine, "spin", 3277, 10);

        engine.play_looped(&asset, 1, 1.0).unwrap();
        let mut out = vec![0.0; 64];
        renderer.render(&mut out);

        // Host stalls while stops keep arriving
        while engine.effects.remove(VoiceId::next()) {}
        assert!(engine.stop_looped(1));
        assert_eq!(engine.deferred_removals(), 1);

        renderer.render(&mut out);
        assert_eq!(engine.active_voices(), 1);

        engine.maintain();
        assert_eq!(engine.deferred_removals(), 0);
        renderer.render(&mut out);
        assert_eq!(engine.active_voices(), 0);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_voice_limit_refuses_trigger() {
        let mut config = EngineConfig::default();
        config.max_voices = 2;
        let (engine, _renderer) = KeysoundEngine::new(config);
        let asset = load(&engine, "kick", 100, 100);

        assert!(engine.play(&asset, 1.0, 0.0).is_some());
        assert!(engine.play(&asset, 1.0, 0.0).is_some());
        assert!(engine.play(&asset, 1.0, 0.0).is_none());
    }
}
