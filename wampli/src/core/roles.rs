use std::fmt::Display;

/// A role a client can take on in a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    // Calls RPC endpoints.
    Caller,
    // Registers RPC endpoints.
    Callee,
    // Publishes events to topics.
    Publisher,
    // Subscribes to events for topics.
    Subscriber,
}

impl PeerRole {
    /// All roles, in the order they are announced.
    pub fn all() -> [PeerRole; 4] {
        [Self::Caller, Self::Callee, Self::Publisher, Self::Subscriber]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Callee => "callee",
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

impl TryFrom<&str> for PeerRole {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "caller" => Ok(Self::Caller),
            "callee" => Ok(Self::Callee),
            "publisher" => Ok(Self::Publisher),
            "subscriber" => Ok(Self::Subscriber),
            _ => Err(Self::Error::msg(format!("invalid peer role: {value}"))),
        }
    }
}

impl Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod roles_test {
    use crate::core::roles::PeerRole;

    #[test]
    fn parses_roles_by_name() {
        for role in PeerRole::all() {
            assert_matches::assert_matches!(PeerRole::try_from(role.as_str()), Ok(parsed) => {
                assert_eq!(parsed, role);
            });
        }
        assert_matches::assert_matches!(PeerRole::try_from("dealer"), Err(_));
    }
}
