//! Session segments.
//!
//! A segment is one bounded run of audio from a single source: the live
//! capture pipeline, or one pre-recorded Ogg file pushed through as-is.
//! Segments are queued on the session and connected one after another as
//! each runs dry.

use std::sync::Mutex;

use crate::stream::StreamHandle;

/// Which pipeline a segment is wired into when it becomes current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPipeline {
    /// capture -> transform -> tee -> encoder / vu meter.
    Live,
    /// A raw Ogg bitstream handed to the network sink unmodified.
    FileSimple,
}

/// One entry of the session's segment queue.
pub struct Segment {
    pipeline: SegmentPipeline,
    driver: Option<String>,
    device: Option<String>,
    handle: Mutex<Option<StreamHandle>>,
}

impl Segment {
    /// Creates a segment that opens its source lazily when connected.
    ///
    /// `driver` selects the capture driver (`auto` when absent for live
    /// segments, `stdio` for file segments); `device` is the
    /// driver-specific device name or path.
    pub fn new(
        pipeline: SegmentPipeline,
        driver: Option<String>,
        device: Option<String>,
    ) -> Self {
        Segment {
            pipeline,
            driver,
            device,
            handle: Mutex::new(None),
        }
    }

    /// Creates a file segment around an already-open bitstream handle.
    pub fn with_handle(pipeline: SegmentPipeline, handle: StreamHandle) -> Self {
        Segment {
            pipeline,
            driver: None,
            device: None,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// The pipeline this segment drives.
    pub fn pipeline(&self) -> SegmentPipeline {
        self.pipeline
    }

    /// The requested capture driver, if any.
    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    /// The requested device or path, if any.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Takes the pre-built handle out of the segment, if one was given.
    pub(crate) fn take_handle(&self) -> Option<StreamHandle> {
        self.handle.lock().unwrap().take()
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("pipeline", &self.pipeline)
            .field("driver", &self.driver)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}
