use std::io::{self, Write};

use viewcache_service::caching::ImageRecord;

/// Renders a record as `<fidelity> <width>x<height> <color> <path>`.
///
/// The size is the size of the source image, not the one of the decoded preview.
pub fn format_record(record: &ImageRecord) -> String {
    format!(
        "{} {}x{} {} {}",
        record.fidelity(),
        record.actual_width(),
        record.actual_height(),
        record.average_color(),
        record.key(),
    )
}

pub fn print_record(out: &mut impl Write, record: &ImageRecord) -> io::Result<()> {
    writeln!(out, "{}", format_record(record))
}
