//! Diagnostic reporting for corrupted or foreign pointers.
//!
//! Releasing a pointer whose block header fails validation must not corrupt
//! the free lists, so both engines leak the block and report the incident
//! instead. Reports go through an injectable [`DiagnosticSink`] so tests
//! can assert on them; the default sink writes one line per incident to
//! standard error.

use std::fmt;

/// Receiver for allocator corruption reports.
///
/// A sink is installed per allocator instance via
/// [`RegionAllocator::set_diagnostic_sink`](crate::region::RegionAllocator::set_diagnostic_sink)
/// and invoked once per rejected release. Implementations must not call
/// back into the allocator that reported the incident.
pub trait DiagnosticSink: Send {
    /// Delivers one formatted report.
    fn report(&mut self, message: fmt::Arguments<'_>);
}

/// The default sink: one line per report on standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn report(&mut self, message: fmt::Arguments<'_>) {
        eprintln!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct CollectSink(Arc<Mutex<Vec<String>>>);

    impl DiagnosticSink for CollectSink {
        fn report(&mut self, message: fmt::Arguments<'_>) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_sink_receives_formatted_reports() {
        let sink = CollectSink::default();
        let mut handle = sink.clone();
        handle.report(format_args!("bad block at {:#x}", 0x1000));

        let reports = sink.0.lock().unwrap();
        assert_eq!(reports.as_slice(), &["bad block at 0x1000".to_string()]);
    }
}
