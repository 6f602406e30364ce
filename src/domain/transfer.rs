use crate::domain::models::{InboundEvent, TransferMode};
use crate::domain::reassembler::{FragmentDecoder, FrameReassembler, Framing};
use tracing::{debug, info, warn};

/// Transfer Mode Controller
///
/// Decides whether inbound fragments are free-form text or part of a CSV
/// capture, and owns everything that mutates while they arrive: the decoder
/// state, the reassembly buffer, the text log and the ready flag. Callers
/// serialize access to it, so appending and scanning for the sentinel
/// always happen as one step.
#[derive(Debug)]
pub struct TransferController {
    mode: TransferMode,
    decoder: FragmentDecoder,
    reassembler: FrameReassembler,
    text_log: String,
    csv_ready: bool,
    completed_csv: Option<String>,
}

impl Default for TransferController {
    fn default() -> Self {
        Self::new(FrameReassembler::default())
    }
}

impl TransferController {
    pub fn new(reassembler: FrameReassembler) -> Self {
        Self {
            mode: TransferMode::Idle,
            decoder: FragmentDecoder::new(),
            reassembler,
            text_log: String::new(),
            csv_ready: false,
            completed_csv: None,
        }
    }

    pub fn with_sentinel(sentinel: &str) -> Self {
        Self::new(FrameReassembler::new(sentinel))
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    pub fn text_log(&self) -> &str {
        &self.text_log
    }

    pub fn csv_ready(&self) -> bool {
        self.csv_ready
    }

    pub fn completed_csv(&self) -> Option<&str> {
        self.completed_csv.as_deref()
    }

    pub fn buffered_len(&self) -> usize {
        self.reassembler.buffer().len()
    }

    /// Enter CSV capture. Returns `false` without touching the buffer when a
    /// capture is already running.
    pub fn start_capture(&mut self) -> bool {
        if self.mode == TransferMode::CapturingCsv {
            debug!(
                buffered = self.reassembler.buffer().len(),
                "CSV capture already in progress, ignoring start request"
            );
            return false;
        }

        self.decoder.reset();
        self.reassembler.reset();
        self.completed_csv = None;
        self.csv_ready = false;
        self.mode = TransferMode::CapturingCsv;
        info!("CSV capture started");
        true
    }

    /// Route one raw notification payload according to the current mode
    pub fn on_fragment(&mut self, fragment: &[u8]) -> Vec<InboundEvent> {
        let decoded = self.decoder.decode(fragment);
        let mut events = Vec::with_capacity(2);

        if decoded.replaced > 0 {
            warn!(
                replaced = decoded.replaced,
                "Malformed UTF-8 in notification payload"
            );
            events.push(InboundEvent::DecodeAnomaly {
                replaced: decoded.replaced,
            });
        }

        match self.mode {
            TransferMode::Idle => {
                if !decoded.text.is_empty() {
                    self.text_log.push_str(&decoded.text);
                    events.push(InboundEvent::TextReceived(decoded.text));
                }
            }
            TransferMode::CapturingCsv => match self.reassembler.push(&decoded.text) {
                Framing::Pending {
                    fragment_len,
                    buffered_len,
                } => {
                    debug!(fragment_len, buffered_len, "CSV fragment buffered");
                    events.push(InboundEvent::CsvFragmentReceived {
                        fragment_len,
                        buffered_len,
                    });
                }
                Framing::Complete(csv) => {
                    info!(bytes = csv.len(), "CSV capture complete");
                    // Bytes held back after the sentinel belong to the discarded suffix
                    self.decoder.reset();
                    self.mode = TransferMode::Idle;
                    self.csv_ready = true;
                    self.completed_csv = Some(csv.clone());
                    events.push(InboundEvent::CsvComplete(csv));
                }
            },
        }

        events
    }

    /// Abandon any capture and forget decoder state, e.g. when the link goes away.
    /// Returns the number of buffered bytes thrown away.
    pub fn abort(&mut self) -> usize {
        self.decoder.reset();
        if self.mode != TransferMode::CapturingCsv {
            return 0;
        }

        let discarded = self.reassembler.reset();
        self.mode = TransferMode::Idle;
        if discarded > 0 {
            warn!(discarded, "Discarding incomplete CSV capture");
        }
        discarded
    }

    /// Hand the completed CSV to its consumer and lower the ready flag
    pub fn take_csv(&mut self) -> Option<String> {
        self.csv_ready = false;
        self.completed_csv.take()
    }

    pub fn clear_text_log(&mut self) {
        self.text_log.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reassembler::CSV_END_SENTINEL;

    fn feed(controller: &mut TransferController, fragments: &[&str]) -> Vec<InboundEvent> {
        fragments
            .iter()
            .flat_map(|f| controller.on_fragment(f.as_bytes()))
            .collect()
    }

    fn completions(events: &[InboundEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                InboundEvent::CsvComplete(csv) => Some(csv.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_idle_fragments_build_text_log() {
        let mut c = TransferController::default();
        let events = feed(&mut c, &["hel", "lo ", "world"]);
        assert_eq!(c.text_log(), "hello world");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], InboundEvent::TextReceived("hel".to_string()));
    }

    #[test]
    fn test_idle_treats_sentinel_as_text() {
        let mut c = TransferController::default();
        let events = feed(&mut c, &["a,b\n", CSV_END_SENTINEL]);
        assert!(completions(&events).is_empty());
        assert_eq!(c.text_log(), "a,b\n__CSV_END__");
        assert_eq!(c.mode(), TransferMode::Idle);
        assert!(!c.csv_ready());
    }

    #[test]
    fn test_capture_scenario_separate_sentinel() {
        let mut c = TransferController::default();
        assert!(c.start_capture());
        let events = feed(&mut c, &["a,b\n1,2\n", "__CSV_END__"]);

        assert_eq!(completions(&events), vec!["a,b\n1,2\n".to_string()]);
        assert!(matches!(events[0], InboundEvent::CsvFragmentReceived { .. }));
        assert_eq!(c.mode(), TransferMode::Idle);
        assert!(c.csv_ready());
        assert_eq!(c.text_log(), "");
    }

    #[test]
    fn test_capture_scenario_split_sentinel() {
        let mut c = TransferController::default();
        c.start_capture();
        let events = feed(&mut c, &["a,b\n1,2__CSV", "_END__"]);
        assert_eq!(completions(&events), vec!["a,b\n1,2".to_string()]);
        assert_eq!(c.completed_csv(), Some("a,b\n1,2"));
    }

    #[test]
    fn test_second_start_is_noop() {
        let mut c = TransferController::default();
        assert!(c.start_capture());
        feed(&mut c, &["a,b\n"]);
        assert!(!c.start_capture());
        assert_eq!(c.buffered_len(), 4);

        let events = feed(&mut c, &["1,2\n__CSV_END__"]);
        assert_eq!(completions(&events), vec!["a,b\n1,2\n".to_string()]);

        // Fragments after completion are plain text again
        let events = feed(&mut c, &["__CSV_END__"]);
        assert!(completions(&events).is_empty());
    }

    #[test]
    fn test_text_after_completion_goes_to_log() {
        let mut c = TransferController::default();
        c.start_capture();
        feed(&mut c, &["1__CSV_END__ignored", "ping"]);
        assert_eq!(c.text_log(), "ping");
    }

    #[test]
    fn test_abort_discards_partial_capture() {
        let mut c = TransferController::default();
        c.start_capture();
        feed(&mut c, &["partial"]);

        assert_eq!(c.abort(), 7);
        assert_eq!(c.mode(), TransferMode::Idle);
        assert!(!c.csv_ready());
        assert_eq!(c.completed_csv(), None);

        let events = feed(&mut c, &["__CSV_END__"]);
        assert!(completions(&events).is_empty());
    }

    #[test]
    fn test_restart_clears_previous_result() {
        let mut c = TransferController::default();
        c.start_capture();
        feed(&mut c, &["1,2__CSV_END__"]);
        assert!(c.csv_ready());

        assert!(c.start_capture());
        assert!(!c.csv_ready());
        assert_eq!(c.completed_csv(), None);
    }

    #[test]
    fn test_take_csv_lowers_ready_flag() {
        let mut c = TransferController::default();
        c.start_capture();
        feed(&mut c, &["x\n__CSV_END__"]);
        assert_eq!(c.take_csv().as_deref(), Some("x\n"));
        assert!(!c.csv_ready());
        assert_eq!(c.take_csv(), None);
    }

    #[test]
    fn test_decode_anomaly_is_not_fatal() {
        let mut c = TransferController::default();
        c.start_capture();
        let mut events = c.on_fragment(&[b'1', 0xC0, b',']);
        events.extend(c.on_fragment(b"2__CSV_END__"));

        assert!(events.contains(&InboundEvent::DecodeAnomaly { replaced: 1 }));
        assert_eq!(completions(&events), vec!["1\u{FFFD},2".to_string()]);
    }

    #[test]
    fn test_start_capture_drops_partial_text_code_point() {
        let mut c = TransferController::default();
        c.on_fragment(&[b'h', b'i', 0xC3]);
        assert_eq!(c.text_log(), "hi");

        c.start_capture();
        let events = c.on_fragment(b"a,b__CSV_END__");
        assert!(!events
            .iter()
            .any(|e| matches!(e, InboundEvent::DecodeAnomaly { .. })));
        assert_eq!(completions(&events), vec!["a,b".to_string()]);
    }

    #[test]
    fn test_partial_code_point_after_sentinel_is_discarded() {
        let mut c = TransferController::default();
        c.start_capture();
        let mut fragment = b"x__CSV_END__".to_vec();
        fragment.extend_from_slice(&[0xE2, 0x82]);
        let events = c.on_fragment(&fragment);
        assert_eq!(completions(&events), vec!["x".to_string()]);

        c.on_fragment(b"ok");
        assert_eq!(c.text_log(), "ok");
    }

    #[test]
    fn test_split_code_point_in_text_log() {
        let mut c = TransferController::default();
        let bytes = "ok ✓".as_bytes();
        let (head, tail) = bytes.split_at(bytes.len() - 1);
        c.on_fragment(head);
        c.on_fragment(tail);
        assert_eq!(c.text_log(), "ok ✓");
    }
}
