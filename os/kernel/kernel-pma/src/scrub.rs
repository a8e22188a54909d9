use crate::collab::Scrubber;
use crate::error::{PmaError, Result};
use alloc::vec::Vec;
use log::{debug, error};

/// Scrub `pages` and make sure every one of them completed.
///
/// Any scrubber failure is reported as
/// [`PmaError::InsufficientResources`]: the pages exist but are not known
/// to be zero.
pub(crate) fn scrub_pages(scrubber: &dyn Scrubber, page_size: u64, pages: &[u64]) -> Result<()> {
    let mut done = scrubber.submit_pages(page_size, pages).map_err(|e| {
        error!("scrub submission of {} pages failed: {e}", pages.len());
        PmaError::InsufficientResources
    })?;

    if done.len() < pages.len() {
        let rest = scrubber.wait_for_completion().map_err(|e| {
            error!("waiting for scrub completion failed: {e}");
            PmaError::InsufficientResources
        })?;
        done.extend(rest);
    }

    check_scrubbed(pages, done)
}

fn check_scrubbed(pages: &[u64], mut done: Vec<u64>) -> Result<()> {
    done.sort_unstable();
    let missing = pages
        .iter()
        .filter(|&p| done.binary_search(p).is_err())
        .count();
    if missing == 0 {
        debug!("scrubbed {} pages", pages.len());
        Ok(())
    } else {
        error!("scrubber left {missing} of {} pages unscrubbed", pages.len());
        Err(PmaError::InsufficientResources)
    }
}
