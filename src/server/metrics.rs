//! Process counters exposed in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

pub static UPLOADS_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static UPLOAD_BYTES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static UPLOAD_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static DELETES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static JANITOR_CLEANUPS_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static JANITOR_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);

pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

pub fn render() -> String {
    let counters: [(&str, &str, &AtomicU64); 6] = [
        (
            "dirsync_uploads_total",
            "Objects uploaded and committed.",
            &UPLOADS_TOTAL,
        ),
        (
            "dirsync_upload_bytes_total",
            "Bytes written by committed uploads.",
            &UPLOAD_BYTES_TOTAL,
        ),
        (
            "dirsync_upload_failures_total",
            "Uploads rejected or failed.",
            &UPLOAD_FAILURES_TOTAL,
        ),
        (
            "dirsync_deletes_total",
            "Delete requests handled.",
            &DELETES_TOTAL,
        ),
        (
            "dirsync_janitor_cleanups_total",
            "Blobs removed by the janitor.",
            &JANITOR_CLEANUPS_TOTAL,
        ),
        (
            "dirsync_janitor_failures_total",
            "Janitor cleanups that exhausted their retries.",
            &JANITOR_FAILURES_TOTAL,
        ),
    ];

    let mut out = String::new();
    for (name, help, counter) in counters {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
            counter.load(Ordering::Relaxed)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_every_counter_in_exposition_format() {
        inc(&UPLOADS_TOTAL);
        add(&UPLOAD_BYTES_TOTAL, 11);

        let text = render();
        assert!(text.contains("# TYPE dirsync_uploads_total counter"));
        assert!(text.contains("# HELP dirsync_janitor_cleanups_total"));
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            let mut parts = line.split_whitespace();
            assert!(parts.next().unwrap().starts_with("dirsync_"));
            let value: u64 = parts.next().unwrap().parse().unwrap();
            let _ = value;
        }
    }
}
