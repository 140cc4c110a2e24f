//! Encoder argument strings.
//!
//! The engine treats the argument string as opaque. [`ArgumentBuilder`] is the
//! seam where it is produced; [`TemplateArgumentBuilder`] fills `{placeholder}`
//! templates from the pipeline configuration and the resolved destinations.

use serde::{Deserialize, Serialize};

use relaycast_ipc::PipelineConfig;
use relaycast_transport::ResolvedTarget;

/// Produces encoder argument strings.
pub trait ArgumentBuilder: Send + Sync {
    /// Arguments for a session that only emits preview frames.
    fn preview_arguments(&self, config: &PipelineConfig) -> String;

    /// Arguments for a session that also feeds every destination in `targets`.
    fn stream_arguments(&self, config: &PipelineConfig, targets: &[ResolvedTarget]) -> String;
}

/// Argument templates.
///
/// `stream` may contain `{outputs}`, which is replaced by `output` rendered
/// once per destination (placeholder `{url}`) and joined with
/// `output_separator`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgumentTemplates {
    pub preview: String,
    pub stream: String,
    pub output: String,
    pub output_separator: String,
}

impl Default for ArgumentTemplates {
    fn default() -> Self {
        Self {
            preview: concat!(
                "-hide_banner -nostdin -i \"{capture_source}\" ",
                "-vf scale={width}:{height} -r {fps} ",
                "-pix_fmt bgr24 -f rawvideo pipe:1"
            )
            .to_string(),
            stream: concat!(
                "-hide_banner -i \"{capture_source}\" ",
                "-map 0:v -vf scale={width}:{height} -r {fps} -pix_fmt bgr24 -f rawvideo pipe:1 ",
                "-map 0:v -map 0:a? -c:v {encoder} -preset {preset} -b:v {video_bitrate}k ",
                "-c:a aac -b:a {audio_bitrate}k -f tee \"{outputs}\""
            )
            .to_string(),
            output: "[f=flv:onfail=ignore]{url}".to_string(),
            output_separator: "|".to_string(),
        }
    }
}

/// [`ArgumentBuilder`] driven by [`ArgumentTemplates`].
#[derive(Debug, Clone, Default)]
pub struct TemplateArgumentBuilder {
    templates: ArgumentTemplates,
}

impl TemplateArgumentBuilder {
    /// Create a builder over `templates`.
    pub fn new(templates: ArgumentTemplates) -> Self {
        Self { templates }
    }

    /// Templates in use.
    pub fn templates(&self) -> &ArgumentTemplates {
        &self.templates
    }

    fn outputs(&self, targets: &[ResolvedTarget]) -> String {
        targets
            .iter()
            .map(|target| render(&self.templates.output, &[("url", target.url.clone())]))
            .collect::<Vec<_>>()
            .join(&self.templates.output_separator)
    }
}

impl ArgumentBuilder for TemplateArgumentBuilder {
    fn preview_arguments(&self, config: &PipelineConfig) -> String {
        render(&self.templates.preview, &config_values(config))
    }

    fn stream_arguments(&self, config: &PipelineConfig, targets: &[ResolvedTarget]) -> String {
        let mut values = config_values(config);
        values.push(("outputs", self.outputs(targets)));
        render(&self.templates.stream, &values)
    }
}

fn config_values(config: &PipelineConfig) -> Vec<(&'static str, String)> {
    vec![
        ("width", config.width.to_string()),
        ("height", config.height.to_string()),
        ("fps", config.fps.to_string()),
        ("rotation", config.rotation.to_string()),
        ("capture_source", config.capture_source.clone()),
        ("audio_source", config.audio_source.clone()),
        ("video_bitrate", config.video_bitrate_kbps.to_string()),
        ("audio_bitrate", config.audio_bitrate_kbps.to_string()),
        ("encoder", config.encoder.clone()),
        ("preset", config.preset.clone()),
        ("overlay_pipe", config.overlay_pipe.clone().unwrap_or_default()),
    ]
}

/// Replace every `{name}` in `template`. Unknown placeholders are kept.
fn render(template: &str, values: &[(&str, String)]) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let replacement = after.find('}').and_then(|close| {
            let name = &after[..close];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (value, close))
        });

        match replacement {
            Some((value, close)) => {
                rendered.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                rendered.push('{');
                rest = after;
            }
        }
    }

    rendered.push_str(rest);
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_ipc::StreamTarget;

    fn target(name: &str, url: &str, key: &str) -> ResolvedTarget {
        ResolvedTarget::resolve(&StreamTarget::new("custom", name, url, key)).unwrap()
    }

    #[test]
    fn test_render_placeholders() {
        let values = [("width", "1280".to_string()), ("height", "720".to_string())];
        assert_eq!(render("scale={width}:{height}", &values), "scale=1280:720");
        assert_eq!(render("{unknown} {width}", &values), "{unknown} 1280");
        assert_eq!(render("trailing {", &values), "trailing {");
    }

    #[test]
    fn test_preview_arguments() {
        let builder = TemplateArgumentBuilder::new(ArgumentTemplates {
            preview: "-i {capture_source} -s {width}x{height} -r {fps} -overlay {overlay_pipe}".into(),
            ..Default::default()
        });
        let config = PipelineConfig {
            capture_source: "cam0".into(),
            width: 640,
            height: 360,
            fps: 25,
            ..Default::default()
        };

        assert_eq!(
            builder.preview_arguments(&config),
            "-i cam0 -s 640x360 -r 25 -overlay "
        );
    }

    #[test]
    fn test_stream_arguments_fan_out() {
        let builder = TemplateArgumentBuilder::default();
        let config = PipelineConfig::default();
        let targets = [
            target("A", "rtmp://a/live", "ka"),
            target("B", "rtmp://b/app/", "kb"),
        ];

        let args = builder.stream_arguments(&config, &targets);
        assert!(args.contains("\"[f=flv:onfail=ignore]rtmp://a/live/ka|[f=flv:onfail=ignore]rtmp://b/app/kb\""));
        assert!(args.contains("-c:v libx264 -preset veryfast -b:v 4500k"));
        assert!(!args.contains('{'));
    }
}
