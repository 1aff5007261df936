//! Progress reporting for extraction operations.

/// Kinds of progress events, in the order they are emitted for one
/// operation: `ImageBegin`/`TreeBegin`, `DirStructureBegin`,
/// `DirStructureEnd`, zero or more `Streams`, `ApplyTimestamps`, then
/// `ImageEnd`/`TreeEnd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMsg {
    /// A full image extraction is starting.
    ImageBegin,
    /// A subtree extraction is starting.
    TreeBegin,
    DirStructureBegin,
    DirStructureEnd,
    /// Stream data was written; inspect the byte counters.
    Streams,
    ApplyTimestamps,
    TreeEnd,
    ImageEnd,
}

/// Counters handed to the progress callback.
///
/// When extracting from a pipe, `total_bytes` is an estimate taken from
/// the XML data, so `completed_bytes` may land above or below it; the
/// final `Streams` event pins `completed_bytes` to `total_bytes`.
#[derive(Debug, Clone, Default)]
pub struct ProgressInfo {
    /// 1-based index of the image being extracted, 0 for bare trees.
    pub image: usize,
    pub image_name: Option<String>,
    pub target: String,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub num_streams: u64,
}

pub type ProgressFn<'a> = dyn FnMut(ProgressMsg, &ProgressInfo) + 'a;

/// Number of `Streams` events per operation, total bytes permitting.
const PROGRESS_STEPS: u64 = 128;

pub(crate) struct Progress<'a> {
    pub info: ProgressInfo,
    callback: Option<&'a mut ProgressFn<'a>>,
    next_at: u64,
}

impl<'a> Progress<'a> {
    pub fn new(callback: Option<&'a mut ProgressFn<'a>>) -> Self {
        Self {
            info: ProgressInfo::default(),
            callback,
            next_at: 0,
        }
    }

    /// Resets the counters for a new operation sharing this callback.
    pub fn begin_op(&mut self, image: usize, image_name: Option<String>, target: &str) {
        self.info = ProgressInfo {
            image,
            image_name,
            target: target.to_string(),
            ..Default::default()
        };
        self.next_at = 0;
    }

    pub fn emit(&mut self, msg: ProgressMsg) {
        if let Some(callback) = self.callback.as_mut() {
            callback(msg, &self.info);
        }
    }

    pub fn enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Account for one extracted copy of a stream and emit a `Streams`
    /// event whenever the completed count crosses the next 1/128
    /// threshold of the total.
    pub fn stream_completed(&mut self, bytes: u64) {
        self.info.completed_bytes += bytes;
        if self.callback.is_none() || self.info.completed_bytes < self.next_at {
            return;
        }
        self.emit(ProgressMsg::Streams);
        if self.info.completed_bytes >= self.info.total_bytes {
            self.next_at = u64::MAX;
        } else {
            self.next_at += self.info.total_bytes / PROGRESS_STEPS;
            if self.next_at > self.info.total_bytes {
                self.next_at = self.info.total_bytes;
            }
        }
    }

    /// Pipe extraction may under-estimate the total; make the last
    /// `Streams` event consistent before the finalization events.
    pub fn finish_streams(&mut self) {
        if self.info.completed_bytes != self.info.total_bytes {
            log::debug!(
                "Calculated {} bytes to extract, but actually extracted {}",
                self.info.total_bytes,
                self.info.completed_bytes
            );
        }
        if self.enabled() && self.info.completed_bytes < self.info.total_bytes {
            self.info.completed_bytes = self.info.total_bytes;
            self.emit(ProgressMsg::Streams);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_thresholds() {
        let events = std::cell::RefCell::new(Vec::new());
        let mut callback = |msg: ProgressMsg, info: &ProgressInfo| {
            events.borrow_mut().push((msg, info.completed_bytes));
        };
        let mut progress = Progress::new(Some(&mut callback));
        progress.info.total_bytes = 1280;

        // First completion always reports; subsequent ones only at 1/128
        // increments.
        progress.stream_completed(1);
        progress.stream_completed(2);
        progress.stream_completed(20);
        assert_eq!(
            *events.borrow(),
            vec![(ProgressMsg::Streams, 1), (ProgressMsg::Streams, 23)]
        );

        events.borrow_mut().clear();
        progress.stream_completed(1280 - 23);
        assert_eq!(*events.borrow(), vec![(ProgressMsg::Streams, 1280)]);

        // At the total, the threshold saturates.
        events.borrow_mut().clear();
        progress.stream_completed(1);
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn test_finish_streams_bumps_to_total() {
        let events = std::cell::RefCell::new(Vec::new());
        let mut callback = |msg: ProgressMsg, info: &ProgressInfo| {
            events
                .borrow_mut()
                .push((msg, info.completed_bytes, info.total_bytes));
        };
        let mut progress = Progress::new(Some(&mut callback));
        progress.info.total_bytes = 100;
        progress.info.completed_bytes = 60;
        progress.finish_streams();
        assert_eq!(*events.borrow(), vec![(ProgressMsg::Streams, 100, 100)]);
    }
}
