//! viewcache.
//!
//! Loads images the way an image viewer does: a quick preview is shown first and replaced by the
//! full image once it is decoded. Every image that would be shown is printed on its own line.

mod cli;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            viewcache_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
