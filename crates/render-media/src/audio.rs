//! Audio enhancement filter chains.

use render_models::{AudioEffect, AudioEnhancement};

/// Build an `-af` chain from the enabled enhancements.
///
/// `media_duration_secs` anchors fade-outs at the end of the track.
/// Returns `None` when nothing is enabled.
pub fn build_audio_filter_chain<'a>(
    enhancements: impl IntoIterator<Item = &'a AudioEnhancement>,
    media_duration_secs: f64,
) -> Option<String> {
    let filters: Vec<String> = enhancements
        .into_iter()
        .filter(|e| e.enabled)
        .map(|e| audio_filter(&e.effect, media_duration_secs))
        .collect();

    if filters.is_empty() {
        None
    } else {
        Some(filters.join(","))
    }
}

fn audio_filter(effect: &AudioEffect, media_duration_secs: f64) -> String {
    match effect {
        AudioEffect::Normalize { target_lufs } => {
            format!("loudnorm=I={}:TP=-1.5:LRA=11", target_lufs)
        }
        AudioEffect::Compression {
            threshold_db,
            ratio,
            attack_ms,
            release_ms,
        } => format!(
            "acompressor=threshold={}dB:ratio={}:attack={}:release={}",
            threshold_db, ratio, attack_ms, release_ms
        ),
        AudioEffect::NoiseReduction { strength } => {
            // afftdn noise floor is in dB, -80..-20
            let nf = -80.0 + strength.clamp(0.0, 1.0) * 60.0;
            format!("afftdn=nf={:.1}", nf)
        }
        AudioEffect::FadeIn { duration_secs } => {
            format!("afade=t=in:st=0:d={}", duration_secs)
        }
        AudioEffect::FadeOut { duration_secs } => {
            let start = (media_duration_secs - duration_secs).max(0.0);
            format!("afade=t=out:st={:.3}:d={}", start, duration_secs)
        }
        AudioEffect::Equalizer { bass, mid, treble } => [
            eq_band(100, 100, *bass),
            eq_band(1000, 200, *mid),
            eq_band(10000, 2000, *treble),
        ]
        .join(","),
        AudioEffect::BassBoost { gain_db } => eq_band(100, 100, *gain_db),
        AudioEffect::TrebleBoost { gain_db } => eq_band(10000, 2000, *gain_db),
        AudioEffect::Volume { gain_db } => format!("volume={}dB", gain_db),
    }
}

fn eq_band(freq: u32, width: u32, gain: f64) -> String {
    format!("equalizer=f={}:width_type=h:width={}:g={}", freq, width, gain)
}
