use crate::Error;
use std::fmt;
use std::str::FromStr;

pub const USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const NEWSLETTER_SERVER: &str = "newsletter";
pub const LID_SERVER: &str = "lid";

/// Address of a user, device, group or channel on the network.
///
/// Textual form is `user@server`, or `user:device@server` for a specific
/// companion device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    user: String,
    server: String,
    device: u32,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            device: 0,
        }
    }

    pub fn user_jid(phone_number: u64) -> Self {
        Self::new(phone_number.to_string(), USER_SERVER)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(id, GROUP_SERVER)
    }

    pub fn newsletter(id: impl Into<String>) -> Self {
        Self::new(id, NEWSLETTER_SERVER)
    }

    pub fn with_device(mut self, device: u32) -> Self {
        self.device = device;
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == NEWSLETTER_SERVER
    }

    /// Drops the device component.
    pub fn to_user_jid(&self) -> Self {
        Self::new(self.user.clone(), self.server.clone())
    }

    pub fn to_session_address(&self) -> SessionAddress {
        SessionAddress::new(self.user.clone(), self.device)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.user.is_empty(), self.device) {
            (true, _) => write!(f, "{}", self.server),
            (false, 0) => write!(f, "{}@{}", self.user, self.server),
            (false, device) => write!(f, "{}:{}@{}", self.user, device, self.server),
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((local, server)) = value.split_once('@') else {
            if value.is_empty() {
                return Err(Error::Serde("Empty jid".to_string()));
            }
            return Ok(Self::new("", value));
        };

        if server.is_empty() {
            return Err(Error::Serde(format!("Missing server in jid {value}")));
        }

        match local.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse::<u32>()
                    .map_err(|err| Error::Serde(format!("Invalid device in jid {value}: {err}")))?;
                Ok(Self::new(user, server).with_device(device))
            }
            None => Ok(Self::new(local, server)),
        }
    }
}

/// Key of the per-peer session map: a peer and one of its devices.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionAddress {
    name: String,
    device_id: u32,
}

impl SessionAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

/// Identifies one sender's chain inside a group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderKeyName {
    group_id: String,
    sender: SessionAddress,
}

impl SenderKeyName {
    pub fn new(group_id: impl Into<String>, sender: SessionAddress) -> Self {
        Self {
            group_id: group_id.into(),
            sender,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn sender(&self) -> &SessionAddress {
        &self.sender
    }
}

impl fmt::Display for SenderKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.group_id, self.sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let jid: Jid = "393495089819@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user(), "393495089819");
        assert_eq!(jid.server(), USER_SERVER);
        assert_eq!(jid.device(), 0);
        assert_eq!(jid.to_string(), "393495089819@s.whatsapp.net");

        let device: Jid = "393495089819:12@s.whatsapp.net".parse().unwrap();
        assert_eq!(device.device(), 12);
        assert_eq!(device.to_string(), "393495089819:12@s.whatsapp.net");
        assert_eq!(device.to_user_jid(), jid);

        let server: Jid = "g.us".parse().unwrap();
        assert_eq!(server.to_string(), "g.us");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<Jid>().is_err());
        assert!("user@".parse::<Jid>().is_err());
        assert!("user:abc@s.whatsapp.net".parse::<Jid>().is_err());
    }

    #[test]
    fn test_session_address_from_jid() {
        let jid = Jid::user_jid(15551234567).with_device(3);
        let address = jid.to_session_address();

        assert_eq!(address.name(), "15551234567");
        assert_eq!(address.device_id(), 3);
        assert_eq!(address.to_string(), "15551234567.3");
    }
}
