use crate::core::uri::Uri;

/// The reason for closing a WAMP session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    #[default]
    Normal,
    SystemShutdown,
    CloseRealm,
    GoodbyeAndOut,
}

impl CloseReason {
    fn uri_component(&self) -> &str {
        match self {
            Self::Normal => "normal",
            Self::SystemShutdown => "system_shutdown",
            Self::CloseRealm => "close_realm",
            Self::GoodbyeAndOut => "goodbye_and_out",
        }
    }

    /// URI for the close reason.
    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.close.{}", self.uri_component()))
    }
}

#[cfg(test)]
mod close_test {
    use crate::core::close::CloseReason;

    #[test]
    fn builds_close_uris() {
        assert_eq!(CloseReason::Normal.uri().as_ref(), "wamp.close.normal");
        assert_eq!(
            CloseReason::GoodbyeAndOut.uri().as_ref(),
            "wamp.close.goodbye_and_out"
        );
    }
}
