use crate::transport::Address;

/// Which APNs environment to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    pub fn gateway(&self) -> Address {
        let host = match self {
            Self::Production => "gateway.push.apple.com",
            Self::Sandbox => "gateway.sandbox.push.apple.com",
        };

        Address {
            host: host.into(),
            port: 2195,
        }
    }

    pub fn feedback(&self) -> Address {
        let host = match self {
            Self::Production => "feedback.push.apple.com",
            Self::Sandbox => "feedback.sandbox.push.apple.com",
        };

        Address {
            host: host.into(),
            port: 2196,
        }
    }
}
