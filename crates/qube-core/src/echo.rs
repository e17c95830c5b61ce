#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEcho {
    command_id: Option<u64>,
    text: String,
}

/// Client-side suppression of a command's own echo in the output it provoked.
///
/// Literal mode drops the first line containing the last sent command from
/// the very next batch, whatever that batch is. Tagged mode only touches
/// frames the hub attributed to the pending command.
#[derive(Debug, Default)]
pub struct EchoFilter {
    pending: Option<PendingEcho>,
}

impl EchoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&mut self, text: &str) {
        self.set_pending(None, text);
    }

    pub fn remember_tagged(&mut self, command_id: u64, text: &str) {
        self.set_pending(Some(command_id), text);
    }

    pub fn pending_text(&self) -> Option<&str> {
        self.pending.as_ref().map(|pending| pending.text.as_str())
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }

    pub fn filter_batch(&mut self, batch: &str) -> String {
        match self.pending.take() {
            Some(pending) => remove_first_line_containing(batch, &pending.text).0,
            None => batch.to_string(),
        }
    }

    pub fn filter_frame(&mut self, command_id: Option<u64>, data: &str) -> String {
        let Some(pending) = self.pending.as_ref() else {
            return data.to_string();
        };
        if pending.command_id.is_none() || pending.command_id != command_id {
            return data.to_string();
        }
        let (filtered, removed) = remove_first_line_containing(data, &pending.text);
        if removed {
            self.pending = None;
        }
        filtered
    }

    /// Forgets a tagged echo once the hub reports its command settled.
    pub fn settle(&mut self, command_id: u64) {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.command_id == Some(command_id))
        {
            self.pending = None;
        }
    }

    fn set_pending(&mut self, command_id: Option<u64>, text: &str) {
        let text = text.trim();
        self.pending = if text.is_empty() {
            None
        } else {
            Some(PendingEcho {
                command_id,
                text: text.to_string(),
            })
        };
    }
}

fn remove_first_line_containing(batch: &str, needle: &str) -> (String, bool) {
    let mut out = String::with_capacity(batch.len());
    let mut removed = false;
    for segment in batch.split_inclusive('\n') {
        if !removed && segment.trim_end_matches(&['\n', '\r'][..]).contains(needle) {
            removed = true;
            continue;
        }
        out.push_str(segment);
    }
    (out, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_filter_removes_only_first_matching_line() {
        let mut filter = EchoFilter::new();
        filter.remember("ls");
        let out = filter.filter_batch("ls\r\nls.txt\nnotes\n");
        assert_eq!(out, "ls.txt\nnotes\n");
        assert!(filter.pending_text().is_none());
    }

    #[test]
    fn literal_filter_is_single_use() {
        let mut filter = EchoFilter::new();
        filter.remember("whoami");
        assert_eq!(filter.filter_batch("banner\n"), "banner\n");
        assert_eq!(filter.filter_batch("whoami\nroot\n"), "whoami\nroot\n");
    }

    #[test]
    fn literal_filter_keeps_batch_without_match() {
        let mut filter = EchoFilter::new();
        filter.remember("pwd");
        assert_eq!(filter.filter_batch("/root"), "/root");
    }

    #[test]
    fn blank_command_is_not_remembered() {
        let mut filter = EchoFilter::new();
        filter.remember("   ");
        assert!(filter.pending_text().is_none());
    }

    #[test]
    fn tagged_filter_ignores_frames_of_other_commands() {
        let mut filter = EchoFilter::new();
        filter.remember_tagged(2, "echo hi");
        assert_eq!(filter.filter_frame(None, "echo hi from cron\n"), "echo hi from cron\n");
        assert_eq!(filter.filter_frame(Some(1), "echo hi\n"), "echo hi\n");
        assert_eq!(filter.pending_text(), Some("echo hi"));

        assert_eq!(filter.filter_frame(Some(2), "echo hi\r\nhi\r\n"), "hi\r\n");
        assert!(filter.pending_text().is_none());
        assert_eq!(filter.filter_frame(Some(2), "echo hi\n"), "echo hi\n");
    }

    #[test]
    fn tagged_filter_waits_across_frames_until_match() {
        let mut filter = EchoFilter::new();
        filter.remember_tagged(5, "make");
        assert_eq!(filter.filter_frame(Some(5), "\n"), "\n");
        assert_eq!(filter.filter_frame(Some(5), "make\nbuilding\n"), "building\n");
    }

    #[test]
    fn settle_drops_pending_for_matching_command() {
        let mut filter = EchoFilter::new();
        filter.remember_tagged(3, "cd /");
        filter.settle(4);
        assert!(filter.pending_text().is_some());
        filter.settle(3);
        assert!(filter.pending_text().is_none());
    }
}
