use ydinabi::fs::DriverKind;

/// Payload of a DRIVER node: the registered kind and the readable flag a
/// driver toggles to announce buffered data (`EV_DATA_READABLE`).
#[derive(Debug)]
pub struct Server {
    kind: DriverKind,
    readable: bool,
}

impl Server {
    pub fn new(kind: DriverKind) -> Self {
        Self {
            kind,
            readable: false,
        }
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn is_single_pipe(&self) -> bool {
        self.kind.contains(DriverKind::SINGLE_PIPE)
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// Returns whether the flag actually changed
    pub fn set_readable(&mut self, readable: bool) -> bool {
        let changed = self.readable != readable;
        self.readable = readable;
        changed
    }
}

/// Driver names are exotic-name-free: non-empty and strictly alphanumeric
pub fn valid_driver_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_driver_name("echo"));
        assert!(valid_driver_name("ata0"));
        assert!(!valid_driver_name(""));
        assert!(!valid_driver_name("abc.def"));
        assert!(!valid_driver_name("a/b"));
        assert!(!valid_driver_name("työ"));
    }

    #[test]
    fn readable_toggle_reports_change() {
        let mut s = Server::new(DriverKind::CHAR);
        assert!(s.set_readable(true));
        assert!(!s.set_readable(true));
        assert!(s.set_readable(false));
    }
}
