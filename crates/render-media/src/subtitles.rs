//! Subtitle burn-in and soft-track helpers.

use render_models::{SubtitleSpec, SubtitleStyle};

use crate::watermark::escape_filter_value;

/// `#RRGGBB` -> ASS `&H00BBGGRR`. Invalid input falls back to white.
pub fn ass_color(color: &str) -> String {
    let hex = color.trim_start_matches('#');
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return "&H00FFFFFF".to_string();
    }
    let (r, g, b) = (&hex[0..2], &hex[2..4], &hex[4..6]);
    format!("&H00{}{}{}", b, g, r).to_uppercase()
}

/// libass `force_style` value for a style.
pub fn force_style(style: &SubtitleStyle) -> String {
    format!(
        "FontName={},FontSize={},PrimaryColour={},OutlineColour={},BorderStyle=1,Outline={}",
        style.font_name,
        style.font_size,
        ass_color(&style.primary_color),
        ass_color(&style.outline_color),
        style.outline
    )
}

/// `-vf` expression that burns `spec.source` into the picture.
pub fn burn_in_filter(spec: &SubtitleSpec) -> String {
    let mut filter = format!("subtitles='{}'", escape_filter_value(&spec.source));
    if let Some(style) = &spec.style {
        filter.push_str(&format!(":force_style='{}'", force_style(style)));
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ass_color() {
        assert_eq!(ass_color("#FF8800"), "&H000088FF");
        assert_eq!(ass_color("#ffffff"), "&H00FFFFFF");
        assert_eq!(ass_color("red"), "&H00FFFFFF");
    }

    #[test]
    fn test_burn_in_without_style() {
        let spec = SubtitleSpec {
            enabled: true,
            burn_in: true,
            source: "/work/subs.srt".to_string(),
            style: None,
        };
        assert_eq!(burn_in_filter(&spec), "subtitles='/work/subs.srt'");
    }

    #[test]
    fn test_burn_in_with_style() {
        let spec = SubtitleSpec {
            enabled: true,
            burn_in: true,
            source: "C:/subs.srt".to_string(),
            style: Some(SubtitleStyle::default()),
        };
        let filter = burn_in_filter(&spec);
        assert!(filter.starts_with("subtitles='C\\:/subs.srt'"));
        assert!(filter.contains("FontName=Arial"));
        assert!(filter.contains("OutlineColour=&H00000000"));
    }
}
