//! Looped voices by channel
//!
//! Sustained sounds (slider ticks, spinner hum) loop until told to stop and
//! are addressed by a caller-chosen channel id instead of a voice id. At most
//! one voice loops per channel; registering a new one hands back the voice it
//! replaced so the caller can remove it from the mixer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::voice::{VoiceControl, VoiceId};

struct LoopEntry {
    voice: VoiceId,
    control: Arc<VoiceControl>,
}

#[derive(Default)]
pub struct LoopManager {
    loops: Mutex<HashMap<u32, LoopEntry>>,
}

impl LoopManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, LoopEntry>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `voice` on `channel`; returns the voice it replaces
    pub fn register(
        &self,
        channel: u32,
        voice: VoiceId,
        control: Arc<VoiceControl>,
    ) -> Option<VoiceId> {
        self.lock()
            .insert(channel, LoopEntry { voice, control })
            .map(|previous| previous.voice)
    }

    /// Stop tracking `channel`; returns its voice
    pub fn take(&self, channel: u32) -> Option<VoiceId> {
        self.lock().remove(&channel).map(|entry| entry.voice)
    }

    /// Change the volume of the voice looping on `channel`
    pub fn set_volume(&self, channel: u32, volume: f32) -> bool {
        match self.lock().get(&channel) {
            Some(entry) => {
                entry.control.set_volume(volume);
                true
            }
            None => false,
        }
    }

    pub fn voice(&self, channel: u32) -> Option<VoiceId> {
        self.lock().get(&channel).map(|entry| entry.voice)
    }

    /// Forget every loop; returns their voices
    pub fn drain(&self) -> Vec<VoiceId> {
        self.lock().drain().map(|(_, entry)| entry.voice).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
