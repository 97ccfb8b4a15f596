//! Keysound offline renderer
//!
//! Decodes sound files through the keysound cache, triggers them on a timeline
//! and writes the engine output to a 16-bit stereo WAV.
//!
//! ```text
//! keysound-render [--config engine.yaml] <out.wav> <seconds> <file[@time_s[@balance]]>...
//! ```
//!
//! Triggers fire at the start of the 512-frame block containing their time.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use keysound_core::cache::{CacheStatus, DEFAULT_CATEGORY};
use keysound_core::config::{load_config, EngineConfig};
use keysound_core::engine::KeysoundEngine;

const BLOCK_FRAMES: usize = 512;

/// One scheduled playback
#[derive(Debug, Clone, PartialEq)]
struct Trigger {
    path: PathBuf,
    time: f64,
    balance: f32,
}

struct Args {
    config: Option<PathBuf>,
    output: PathBuf,
    seconds: f64,
    triggers: Vec<Trigger>,
}

fn usage() -> &'static str {
    "usage: keysound-render [--config engine.yaml] <out.wav> <seconds> <file[@time_s[@balance]]>..."
}

/// `file`, `file@0.5` or `file@0.5@-0.3`
fn parse_trigger(arg: &str) -> Result<Trigger> {
    let mut parts = arg.split('@');
    let path = parts.next().filter(|p| !p.is_empty());
    let Some(path) = path else {
        bail!("empty file name in trigger '{}'", arg);
    };

    let time = match parts.next() {
        Some(t) => t
            .parse::<f64>()
            .with_context(|| format!("invalid trigger time in '{}'", arg))?,
        None => 0.0,
    };
    let balance = match parts.next() {
        Some(b) => b
            .parse::<f32>()
            .with_context(|| format!("invalid balance in '{}'", arg))?,
        None => 0.0,
    };
    if parts.next().is_some() {
        bail!("too many '@' fields in trigger '{}'", arg);
    }
    if time < 0.0 {
        bail!("negative trigger time in '{}'", arg);
    }

    Ok(Trigger {
        path: PathBuf::from(path),
        time,
        balance: balance.clamp(-1.0, 1.0),
    })
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut config = None;
    let mut positional = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => bail!(usage()),
            _ => positional.push(arg.as_str()),
        }
    }

    if positional.len() < 3 {
        bail!(usage());
    }

    let seconds = positional[1]
        .parse::<f64>()
        .with_context(|| format!("invalid duration '{}'", positional[1]))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("duration must be positive");
    }

    let triggers = positional[2..]
        .iter()
        .map(|arg| parse_trigger(arg))
        .collect::<Result<Vec<_>>>()?;

    Ok(Args {
        config,
        output: PathBuf::from(positional[0]),
        seconds,
        triggers,
    })
}

fn write_wav(path: &Path, sample_rate: u32, samples: &[f32]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create {:?}", path))?;
    for &s in samples {
        let value = (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        writer.write_sample(value)?;
    }
    writer.finalize()?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let config: EngineConfig = match &args.config {
        Some(path) => load_config(path),
        None => EngineConfig::default(),
    };
    let sample_rate = config.sample_rate;
    let (engine, mut renderer) = KeysoundEngine::new(config);

    // Decode everything up front; unreadable files play as silence
    let mut scheduled = Vec::with_capacity(args.triggers.len());
    for trigger in &args.triggers {
        let key = trigger.path.to_string_lossy();
        let result = engine
            .cache()
            .try_get_or_create(&key, trigger.path.as_path(), DEFAULT_CATEGORY)?;
        let asset = match (result.status, result.asset) {
            (CacheStatus::Failed, _) | (_, None) => {
                log::warn!("{:?}: decode failed, using silence", trigger.path);
                engine.cache().empty_asset()
            }
            (status, Some(asset)) => {
                log::info!("{:?}: {:?}", trigger.path, status);
                asset
            }
        };
        let frame = (trigger.time * sample_rate as f64).round() as usize;
        scheduled.push((frame, trigger.balance, asset));
    }
    scheduled.sort_by_key(|(frame, _, _)| *frame);

    let stats = engine.cache().stats();
    log::info!(
        "Cache: {} created, {} hits, {} failures",
        stats.creates,
        stats.hits,
        stats.failures
    );

    let total_frames = (args.seconds * sample_rate as f64).ceil() as usize;
    let mut output = vec![0.0f32; total_frames * 2];
    let mut next = 0;

    for (block_index, block) in output.chunks_mut(BLOCK_FRAMES * 2).enumerate() {
        let block_end = (block_index + 1) * BLOCK_FRAMES;
        while next < scheduled.len() && scheduled[next].0 < block_end {
            let (_, balance, asset) = &scheduled[next];
            engine.play(asset, 1.0, *balance);
            next += 1;
        }
        renderer.render(block);
        engine.maintain();
    }

    write_wav(&args.output, sample_rate, &output)?;
    log::info!(
        "Wrote {:.2}s to {:?} (limiter gain {:.3})",
        args.seconds,
        args.output,
        renderer.limiter_gain()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&args)?;
    log::info!(
        "keysound-render: {} triggers, {:.2}s -> {:?}",
        args.triggers.len(),
        args.seconds,
        args.output
    );
    run(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_trigger_forms() {
        assert_eq!(
            parse_trigger("kick.wav").unwrap(),
            Trigger { path: "kick.wav".into(), time: 0.0, balance: 0.0 }
        );
        let t = parse_trigger("snare.ogg@1.25@-0.5").unwrap();
        assert_eq!(t.time, 1.25);
        assert_eq!(t.balance, -0.5);
        assert_eq!(parse_trigger("hat.wav@0@4").unwrap().balance, 1.0);
    }

    #[test]
    fn test_parse_trigger_rejects_garbage() {
        assert!(parse_trigger("@1.0").is_err());
        assert!(parse_trigger("a.wav@soon").is_err());
        assert!(parse_trigger("a.wav@-1").is_err());
        assert!(parse_trigger("a.wav@1@0@9").is_err());
    }

    #[test]
    fn test_parse_args() {
        let argv = strings(&["--config", "e.yaml", "out.wav", "2", "a.wav", "b.wav@1"]);
        let args = parse_args(&argv).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("e.yaml")));
        assert_eq!(args.output, PathBuf::from("out.wav"));
        assert_eq!(args.seconds, 2.0);
        assert_eq!(args.triggers.len(), 2);

        assert!(parse_args(&strings(&["out.wav", "2"])).is_err());
        assert!(parse_args(&strings(&["out.wav", "0", "a.wav"])).is_err());
    }
}
