use std::collections::BTreeSet as Set;

/// Members of a kernel set as last applied, with the next state staged until the apply
/// result is known.
#[derive(Debug)]
pub struct Applied {
    /// `None` when the kernel content is unknown, e.g. after a failed update.
    current: Option<Set<String>>,
    staged: Option<Set<String>>,
}

/// Lines needed to go from the applied members to the staged ones.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Diff {
    /// the kernel content is unknown, start from an empty set
    pub flush: bool,
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

impl Applied {
    /// A freshly created (empty) set.
    pub fn new() -> Self {
        Self {
            current: Some(Set::new()),
            staged: None,
        }
    }

    pub fn stage(&mut self, wanted: Set<String>) -> Diff {
        let diff = match &self.current {
            None => Diff {
                flush: true,
                removed: Vec::new(),
                added: wanted.iter().cloned().collect(),
            },
            Some(current) => Diff {
                flush: false,
                removed: current.difference(&wanted).cloned().collect(),
                added: wanted.difference(current).cloned().collect(),
            },
        };
        self.staged = Some(wanted);
        diff
    }

    pub fn commit(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.current = Some(staged);
        }
    }

    /// Forget what the kernel holds; the next stage rebuilds the set from scratch.
    pub fn invalidate(&mut self) {
        self.staged = None;
        self.current = None;
    }

    pub fn is_known(&self) -> bool {
        self.current.is_some()
    }
}
