//! Watermark overlay filters.
//!
//! Image watermarks are scaled relative to the video width and blended with
//! `colorchannelmixer` for opacity; text watermarks use `drawtext`.

use render_models::{WatermarkContent, WatermarkPosition, WatermarkSpec};

/// Filter graph for a watermark.
#[derive(Debug, Clone, PartialEq)]
pub enum WatermarkGraph {
    /// Single-input `-vf` chain.
    Simple(String),
    /// `-filter_complex` graph that reads the image as input 1 and labels
    /// its result `[out]`.
    Overlay { image: String, filter_complex: String },
}

/// Build the filter graph for a watermark spec.
pub fn build_watermark_graph(spec: &WatermarkSpec) -> WatermarkGraph {
    let opacity = spec.opacity.clamp(0.0, 1.0);

    match &spec.content {
        WatermarkContent::Image { path, scale } => {
            let (x, y) = overlay_position(spec.position, spec.margin);
            let scale = scale.clamp(0.01, 1.0);
            let alpha = if opacity < 1.0 {
                format!(",colorchannelmixer=aa={:.2}", opacity)
            } else {
                String::new()
            };
            let filter_complex = format!(
                "[1:v][0:v]scale2ref=w=main_w*{scale:.3}:h=-1[wm][base];\
                 [wm]format=rgba{alpha}[wma];\
                 [base][wma]overlay={x}:{y}:format=auto[out]"
            );
            WatermarkGraph::Overlay {
                image: path.clone(),
                filter_complex,
            }
        }
        WatermarkContent::Text {
            text,
            font_size,
            color,
            font_file,
        } => {
            let (x, y) = text_position(spec.position, spec.margin);
            let mut filter = format!(
                "drawtext=text='{}':fontsize={}:fontcolor={}@{:.2}:x={}:y={}",
                escape_filter_value(text),
                font_size,
                ffmpeg_color(color),
                opacity,
                x,
                y
            );
            if let Some(font) = font_file {
                filter.push_str(&format!(":fontfile='{}'", escape_filter_value(font)));
            }
            WatermarkGraph::Simple(filter)
        }
    }
}

/// Overlay coordinates; `W`/`H` are the video, `w`/`h` the watermark.
fn overlay_position(position: WatermarkPosition, margin: u32) -> (String, String) {
    let m = margin;
    match position {
        WatermarkPosition::TopLeft => (format!("{m}"), format!("{m}")),
        WatermarkPosition::TopRight => (format!("W-w-{m}"), format!("{m}")),
        WatermarkPosition::BottomLeft => (format!("{m}"), format!("H-h-{m}")),
        WatermarkPosition::BottomRight => (format!("W-w-{m}"), format!("H-h-{m}")),
        WatermarkPosition::Center => ("(W-w)/2".to_string(), "(H-h)/2".to_string()),
    }
}

/// drawtext coordinates; `w`/`h` are the video, `tw`/`th` the text.
fn text_position(position: WatermarkPosition, margin: u32) -> (String, String) {
    let m = margin;
    match position {
        WatermarkPosition::TopLeft => (format!("{m}"), format!("{m}")),
        WatermarkPosition::TopRight => (format!("w-tw-{m}"), format!("{m}")),
        WatermarkPosition::BottomLeft => (format!("{m}"), format!("h-th-{m}")),
        WatermarkPosition::BottomRight => (format!("w-tw-{m}"), format!("h-th-{m}")),
        WatermarkPosition::Center => ("(w-tw)/2".to_string(), "(h-th)/2".to_string()),
    }
}

/// `#RRGGBB` -> `0xRRGGBB`; named colors pass through.
pub(crate) fn ffmpeg_color(color: &str) -> String {
    match color.strip_prefix('#') {
        Some(hex) => format!("0x{}", hex),
        None => color.to_string(),
    }
}

/// Escape a value embedded in single quotes inside a filter graph.
pub(crate) fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace(':', "\\:")
        .replace('%', "\\%")
}
