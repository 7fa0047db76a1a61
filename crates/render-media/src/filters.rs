//! Visual filter chains.

use render_models::{EncodingProfile, VideoFilter};

/// Sepia tone matrix for `colorchannelmixer`.
pub const FILTER_SEPIA: &str =
    "colorchannelmixer=.393:.769:.189:0:.349:.686:.168:0:.272:.534:.131";

/// Build a single filter expression.
pub fn video_filter(filter: &VideoFilter) -> String {
    match filter {
        VideoFilter::Brightness { value } => format!("eq=brightness={:.3}", value.clamp(-1.0, 1.0)),
        VideoFilter::Contrast { value } => format!("eq=contrast={:.3}", value.clamp(-1000.0, 1000.0)),
        VideoFilter::Saturation { value } => format!("eq=saturation={:.3}", value.clamp(0.0, 3.0)),
        VideoFilter::Hue { degrees } => format!("hue=h={:.1}", degrees),
        VideoFilter::Blur { radius } => format!("gblur=sigma={:.2}", radius.max(0.0)),
        VideoFilter::Sharpen { amount } => {
            format!("unsharp=5:5:{:.2}:5:5:0.0", amount.clamp(-1.5, 1.5))
        }
        VideoFilter::Grayscale => "hue=s=0".to_string(),
        VideoFilter::Sepia => FILTER_SEPIA.to_string(),
        VideoFilter::Vignette => "vignette=PI/4".to_string(),
        VideoFilter::Denoise { strength } => format!("hqdn3d={:.1}", strength.max(0.0)),
    }
}

/// Scale and letterbox to the output size, then conform the frame rate.
pub fn conform_filter(profile: &EncodingProfile) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps}",
        w = profile.width,
        h = profile.height,
        fps = profile.fps
    )
}

/// Build the `-vf` chain for the `video_filters` stage.
pub fn build_video_filter_chain(filters: &[VideoFilter], profile: &EncodingProfile) -> String {
    filters
        .iter()
        .map(video_filter)
        .chain(std::iter::once(conform_filter(profile)))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_models::{OutputSettings, Resolution};

    fn profile() -> EncodingProfile {
        EncodingProfile::from(&OutputSettings {
            resolution: Resolution::Hd1080,
            ..Default::default()
        })
    }

    #[test]
    fn test_single_filters() {
        assert_eq!(video_filter(&VideoFilter::Grayscale), "hue=s=0");
        assert_eq!(
            video_filter(&VideoFilter::Brightness { value: 3.0 }),
            "eq=brightness=1.000"
        );
        assert!(video_filter(&VideoFilter::Sepia).starts_with("colorchannelmixer"));
    }

    #[test]
    fn test_chain_ends_with_conform() {
        let chain = build_video_filter_chain(
            &[VideoFilter::Contrast { value: 1.2 }, VideoFilter::Vignette],
            &profile(),
        );
        let parts: Vec<&str> = chain.split(',').collect();
        assert_eq!(parts[0], "eq=contrast=1.200");
        assert_eq!(parts[1], "vignette=PI/4");
        assert!(chain.contains("scale=1920:1080"));
        assert!(chain.ends_with("fps=30"));
    }
}
