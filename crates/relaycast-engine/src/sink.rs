//! Preview frame delivery.

use relaycast_process::FrameSink;

/// Creates the preview sink for a session.
///
/// Called once per encoder launch with that launch's dimensions, so a size
/// change between sessions always gets a fresh sink. Whether delivery hops to
/// a UI thread is up to the sink.
pub trait PreviewSinkFactory: Send + Sync {
    fn create(&self, width: u32, height: u32) -> Box<dyn FrameSink>;
}

impl<F> PreviewSinkFactory for F
where
    F: Fn(u32, u32) -> Box<dyn FrameSink> + Send + Sync,
{
    fn create(&self, width: u32, height: u32) -> Box<dyn FrameSink> {
        self(width, height)
    }
}

/// Sink factory that drops every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSinkFactory;

impl PreviewSinkFactory for DiscardSinkFactory {
    fn create(&self, _width: u32, _height: u32) -> Box<dyn FrameSink> {
        Box::new(|_: &[u8]| {})
    }
}
