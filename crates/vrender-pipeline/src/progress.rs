//! Terminal progress for a draining stage.

use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str = "█ {prefix}: |{bar:40}| {percent}% (Workers: {msg}) ({elapsed_precise})";

/// Progress bar of one dispatch: completed over dispatched, plus live workers.
pub struct StageProgress {
    bar: ProgressBar,
}

impl StageProgress {
    pub fn new(label: &str, dispatched: u64, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(dispatched)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::with_template(TEMPLATE) {
            bar.set_style(style.progress_chars("█ "));
        }
        bar.set_prefix(label.to_string());
        bar.set_message("0");
        Self { bar }
    }

    pub fn update(&self, completed: u64, live_workers: u64) {
        self.bar.set_position(completed.min(self.bar.length().unwrap_or(completed)));
        self.bar.set_message(live_workers.to_string());
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_bar_tracks_position() {
        let progress = StageProgress::new("DerpCLI: Level 3", 10, false);
        progress.update(4, 2);
        assert_eq!(progress.bar.position(), 4);
        assert_eq!(progress.bar.message(), "2");

        progress.update(12, 1);
        assert_eq!(progress.bar.position(), 10);
        progress.finish();
        assert!(progress.bar.is_finished());
    }
}
