//! Structural matching of compiled handlers by MD5 digests of fixed windows.

use std::ops::Range;

/// A window of `len` bytes at `rel_offset` from the handler start.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HashWindow {
    pub rel_offset: usize,
    pub len: usize,
    pub digest: [u8; 16],
}

impl HashWindow {
    pub fn of(code: &[u8], range: Range<usize>) -> Option<Self> {
        let bytes = code.get(range.clone())?;
        Some(Self {
            rel_offset: range.start,
            len: range.len(),
            digest: md5::compute(bytes).0,
        })
    }

    pub fn matches(&self, view: &[u8], base: usize) -> bool {
        let start = base + self.rel_offset;
        match view.get(start..start + self.len) {
            Some(bytes) => md5::compute(bytes).0 == self.digest,
            None => false,
        }
    }
}

/// Digests every run of words in `code` not listed in `variable_words`.
///
/// Variable words are the ones whose value depends on placement or
/// arguments: calls, address loads, per-instance immediates.
pub fn windows_excluding(code: &[u8], variable_words: &[usize]) -> Vec<HashWindow> {
    let words = code.len() / 4;
    let mut windows = Vec::new();
    let mut run_start: Option<usize> = None;

    for w in 0..=words {
        let fixed = w < words && !variable_words.contains(&w);
        match (fixed, run_start) {
            (true, None) => run_start = Some(w),
            (false, Some(start)) => {
                if let Some(window) = HashWindow::of(code, start * 4..w * 4) {
                    windows.push(window);
                }
                run_start = None;
            }
            _ => {}
        }
    }
    windows
}

/// True when every window matches. An empty set never matches.
pub fn matches_all(view: &[u8], base: usize, windows: &[HashWindow]) -> bool {
    !windows.is_empty() && windows.iter().all(|w| w.matches(view, base))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> Vec<u8> {
        (0u8..24).collect()
    }

    #[test]
    fn windows_skip_variable_words() {
        let windows = windows_excluding(&code(), &[1, 2, 5]);
        let spans: Vec<(usize, usize)> = windows.iter().map(|w| (w.rel_offset, w.len)).collect();
        assert_eq!(spans, vec![(0, 4), (12, 8)]);
    }

    #[test]
    fn matching_ignores_variable_words_only() {
        let windows = windows_excluding(&code(), &[1]);
        let mut view = vec![0xFFu8; 8];
        view.extend(code());

        let mut patched = view.clone();
        patched[8 + 5] = 0x99; // inside word 1
        assert!(matches_all(&patched, 8, &windows));

        patched[8 + 9] = 0x99; // inside word 2
        assert!(!matches_all(&patched, 8, &windows));

        // Out of bounds is a miss, not a panic.
        assert!(!matches_all(&view, 4, &windows));
        assert!(!matches_all(&view[..20], 8, &windows));
        assert!(!matches_all(&view, 8, &[]));
    }
}
