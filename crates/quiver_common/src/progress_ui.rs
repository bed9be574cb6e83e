use std::time::Duration;

/// Reports progress through a known (or unknown) number of passes.
pub trait ProgressLogger {
    type Session: ProgressSession;
    fn start_session(self, total_passes: Option<usize>) -> Self::Session;
}

pub trait ProgressSession {
    /// Marks the start of the pass called `pass`.
    fn begin_pass(&mut self, pass: &str);
    /// Marks the most recently begun pass as finished.
    fn end_pass(&mut self);
    fn finish(self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProgressMode {
    Hidden,
    Visible,
}

#[derive(Clone, Debug)]
pub struct PassBarLogger {
    func: String,
    mode: ProgressMode,
}

pub fn bar(mode: ProgressMode, func: impl ToString) -> PassBarLogger {
    PassBarLogger {
        func: func.to_string(),
        mode,
    }
}

#[derive(Clone, Debug)]
pub struct PassBarSession {
    func: String,
    bar: indicatif::ProgressBar,
}

const TICK_STRINGS: &[&str] = &["⠉", "⠘", "⠰", "⠤", "⠆", "⠃", "✔"];

impl ProgressLogger for PassBarLogger {
    type Session = PassBarSession;

    fn start_session(self, total_passes: Option<usize>) -> Self::Session {
        let target = match self.mode {
            ProgressMode::Hidden => indicatif::ProgressDrawTarget::hidden(),
            ProgressMode::Visible => indicatif::ProgressDrawTarget::stderr(),
        };
        let bar = indicatif::ProgressBar::with_draw_target(total_passes.map(|n| n as u64), target);
        let template = match total_passes {
            Some(_) => "{spinner:.cyan} [{elapsed_precise}] [{bar:.cyan/blue}] {pos}/{len} {msg}",
            None => "{spinner:.cyan} [{elapsed_precise}] {msg}",
        };
        // The templates are literals; on a parse failure the bar keeps indicatif's default style
        if let Ok(style) = indicatif::ProgressStyle::default_bar().template(template) {
            bar.set_style(style.progress_chars("=> ").tick_strings(TICK_STRINGS));
        }
        bar.set_message(format!("lowering {}", self.func));
        if self.mode == ProgressMode::Visible {
            bar.enable_steady_tick(Duration::from_millis(100));
        }
        PassBarSession {
            func: self.func,
            bar,
        }
    }
}

impl ProgressSession for PassBarSession {
    fn begin_pass(&mut self, pass: &str) {
        self.bar.set_message(format!("lowering {}: {}", self.func, pass));
    }

    fn end_pass(&mut self) {
        self.bar.inc(1);
    }

    fn finish(self) {
        self.bar.finish_with_message(format!("lowered {}", self.func));
    }
}
