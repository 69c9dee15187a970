//! Streaming text accumulation for UI-friendly flushing.
//!
//! Model providers deliver token fragments; pushing every fragment straight
//! to a client produces jittery output. [`ChunkBuffer`] batches a growing
//! stream and flushes when a character threshold is reached or when any of a
//! configured set of delimiter substrings is observed, so consumers see
//! coherent sentences rather than token fragments.

/// Callback invoked with the newly flushed slice and the full accumulation.
pub type FlushFn = Box<dyn FnMut(&str, &str) + Send>;

/// Accumulates a growing text stream and flushes on threshold or delimiter.
///
/// The concatenation of every flushed chunk plus the final [`end`]
/// remainder always equals the complete input stream.
///
/// [`end`]: ChunkBuffer::end
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use taskloom::chunk::ChunkBuffer;
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let mut buffer = ChunkBuffer::new(64, vec![". ".into()], move |chunk, _full| {
///     sink.lock().push(chunk.to_string());
/// });
///
/// buffer.push("First sentence. Second");
/// buffer.push(" sentence tail");
/// buffer.end();
///
/// assert_eq!(seen.lock().join(""), "First sentence. Second sentence tail");
/// ```
pub struct ChunkBuffer {
    pending: String,
    full: String,
    threshold: usize,
    delimiters: Vec<String>,
    on_flush: FlushFn,
}

impl ChunkBuffer {
    /// Create a buffer flushing at `threshold` pending characters or on any
    /// of `delimiters`.
    pub fn new(
        threshold: usize,
        delimiters: Vec<String>,
        on_flush: impl FnMut(&str, &str) + Send + 'static,
    ) -> Self {
        Self {
            pending: String::new(),
            full: String::new(),
            threshold: threshold.max(1),
            delimiters,
            on_flush: Box::new(on_flush),
        }
    }

    /// Append streamed text, flushing as thresholds or delimiters allow.
    pub fn push(&mut self, text: &str) {
        self.pending.push_str(text);
        self.full.push_str(text);

        loop {
            if self.pending.chars().count() >= self.threshold {
                self.flush_all();
                break;
            }
            match self.earliest_delimiter_end() {
                Some(end) => self.flush_to(end),
                None => break,
            }
        }
    }

    /// Flush any remaining accumulation. Idempotent once drained.
    pub fn end(&mut self) {
        if !self.pending.is_empty() {
            self.flush_all();
        }
    }

    /// The complete accumulated stream so far.
    #[must_use]
    pub fn full_text(&self) -> &str {
        &self.full
    }

    /// Byte position just past the earliest delimiter occurrence, if any.
    fn earliest_delimiter_end(&self) -> Option<usize> {
        self.delimiters
            .iter()
            .filter(|d| !d.is_empty())
            .filter_map(|d| self.pending.find(d.as_str()).map(|idx| idx + d.len()))
            .min()
    }

    fn flush_all(&mut self) {
        let chunk = std::mem::take(&mut self.pending);
        (self.on_flush)(&chunk, &self.full);
    }

    fn flush_to(&mut self, end: usize) {
        let rest = self.pending.split_off(end);
        let chunk = std::mem::replace(&mut self.pending, rest);
        (self.on_flush)(&chunk, &self.full);
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("pending_len", &self.pending.len())
            .field("full_len", &self.full.len())
            .field("threshold", &self.threshold)
            .field("delimiters", &self.delimiters)
            .finish()
    }
}
