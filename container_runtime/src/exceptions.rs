//! Declared application exceptions.

use std::collections::HashSet;

use container_core::fault::BeanFault;
use container_core::traits::ApplicationExceptionRegistry;

/// Fault kinds a component declares as business-level failures.
///
/// With `inherited` set, a fault also counts when any fault in its cause
/// chain has a declared kind.
#[derive(Clone, Debug, Default)]
pub struct DeclaredApplicationExceptions {
    kinds: HashSet<String>,
    inherited: bool,
}

impl DeclaredApplicationExceptions {
    /// Declare `kinds`.
    pub fn new(kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
            inherited: false,
        }
    }

    /// Also match on causes.
    pub fn inherited(mut self, inherited: bool) -> Self {
        self.inherited = inherited;
        self
    }

    /// Whether `kind` is declared.
    pub fn is_declared(&self, kind: &str) -> bool {
        self.kinds.contains(kind)
    }
}

impl ApplicationExceptionRegistry for DeclaredApplicationExceptions {
    fn is_application_exception(&self, fault: &BeanFault) -> bool {
        if self.inherited {
            fault.chain().any(|f| self.is_declared(&f.kind))
        } else {
            self.is_declared(&fault.kind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_and_inherited_matching() {
        let fault = BeanFault::new("TransferFailed", "aborted")
            .caused_by(BeanFault::new("InsufficientFunds", "balance 10 < 20"));

        let direct = DeclaredApplicationExceptions::new(["InsufficientFunds"]);
        assert!(!direct.is_application_exception(&fault));

        let inherited = direct.inherited(true);
        assert!(inherited.is_application_exception(&fault));
        assert!(!inherited.is_application_exception(&BeanFault::new("IoError", "disk")));
    }
}
