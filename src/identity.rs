use std::fmt;
use uuid::Uuid;

/// Which kind of client a session belongs to. Each kind is persisted under
/// its own root directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientType {
    Web,
    Mobile,
}

impl ClientType {
    pub fn directory_name(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Mobile => "mobile",
        }
    }

    pub(crate) fn to_proto(self) -> i32 {
        match self {
            Self::Web => 0,
            Self::Mobile => 1,
        }
    }

    pub(crate) fn from_proto(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Web),
            1 => Some(Self::Mobile),
            _ => None,
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directory_name())
    }
}

/// The handles under which one persisted session can be found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub uuid: Uuid,
    pub phone_number: Option<u64>,
    pub alias: Vec<String>,
    pub client_type: ClientType,
}

impl Identity {
    pub fn new(client_type: ClientType) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            phone_number: None,
            alias: Vec::new(),
            client_type,
        }
    }

    pub fn web() -> Self {
        Self::new(ClientType::Web)
    }

    /// Mobile sessions are registered against a phone number up front.
    pub fn mobile(phone_number: u64) -> Self {
        Self {
            phone_number: Some(phone_number),
            ..Self::new(ClientType::Mobile)
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias.push(alias.into());
        self
    }

    pub fn lookup(&self) -> IdentityLookup {
        IdentityLookup {
            uuid: Some(self.uuid),
            phone_number: self.phone_number,
            alias: self.alias.clone(),
        }
    }
}

/// Search criteria for a persisted session. Resolution tries the uuid, then
/// the phone number, then each alias; the first hit wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityLookup {
    pub uuid: Option<Uuid>,
    pub phone_number: Option<u64>,
    pub alias: Vec<String>,
}

impl IdentityLookup {
    pub fn by_uuid(uuid: Uuid) -> Self {
        Self {
            uuid: Some(uuid),
            ..Self::default()
        }
    }

    pub fn by_phone_number(phone_number: u64) -> Self {
        Self {
            phone_number: Some(phone_number),
            ..Self::default()
        }
    }

    pub fn by_alias(alias: impl Into<String>) -> Self {
        Self {
            alias: vec![alias.into()],
            ..Self::default()
        }
    }
}

impl fmt::Display for IdentityLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(uuid) = self.uuid {
            parts.push(format!("uuid={uuid}"));
        }
        if let Some(phone_number) = self.phone_number {
            parts.push(format!("phone={phone_number}"));
        }
        for alias in &self.alias {
            parts.push(format!("alias={alias}"));
        }
        write!(f, "[{}]", parts.join(", "))
    }
}
