//! Verification methods and the predicates derived from what each side
//! advertised.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A verification method a device can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VerificationMethod {
    /// Short authentication string comparison
    SasV1,
    /// Can display a QR code
    QrCodeShow,
    /// Can scan a QR code
    QrCodeScan,
    /// Can complete a QR verification
    Reciprocate,
}

impl VerificationMethod {
    /// Every method this client implements.
    pub const ALL: [Self; 4] = [Self::SasV1, Self::QrCodeShow, Self::QrCodeScan, Self::Reciprocate];

    /// Wire string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SasV1 => "m.sas.v1",
            Self::QrCodeShow => "m.qr_code.show.v1",
            Self::QrCodeScan => "m.qr_code.scan.v1",
            Self::Reciprocate => "m.reciprocate.v1",
        }
    }

    /// Parse a wire string; `None` for methods this client does not know.
    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.as_str() == value)
    }
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for VerificationMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for VerificationMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_wire(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown verification method {value}")))
    }
}

/// Deserialize a method list, dropping methods this client does not know.
pub(crate) fn known_methods<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<VerificationMethod>, D::Error> {
    let values = Vec::<String>::deserialize(deserializer)?;
    let mut methods: Vec<_> = values.iter().filter_map(|v| VerificationMethod::from_wire(v)).collect();
    methods.dedup();
    Ok(methods)
}

/// Methods of both sides of a request.
///
/// The inviter's methods come from the request, the invitee's from the ready
/// response. QR predicates depend on which side we are: the peer can show a
/// code only if it advertised showing and we advertised scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSets {
    /// Methods the inviter advertised in the request
    pub requested: Vec<VerificationMethod>,
    /// Methods the invitee advertised in the ready response
    pub ready: Vec<VerificationMethod>,
    /// True if the peer is the inviter
    pub incoming: bool,
}

impl MethodSets {
    fn ours(&self) -> &[VerificationMethod] {
        if self.incoming { &self.ready } else { &self.requested }
    }

    fn theirs(&self) -> &[VerificationMethod] {
        if self.incoming { &self.requested } else { &self.ready }
    }

    fn both(&self, method: VerificationMethod) -> bool {
        self.requested.contains(&method) && self.ready.contains(&method)
    }

    /// Both sides advertised SAS.
    pub fn sas_supported(&self) -> bool {
        self.both(VerificationMethod::SasV1)
    }

    /// The peer can display a code for us to scan.
    pub fn other_can_show_qr(&self) -> bool {
        self.both(VerificationMethod::Reciprocate)
            && self.theirs().contains(&VerificationMethod::QrCodeShow)
            && self.ours().contains(&VerificationMethod::QrCodeScan)
    }

    /// The peer can scan a code we display.
    pub fn other_can_scan_qr(&self) -> bool {
        self.both(VerificationMethod::Reciprocate)
            && self.theirs().contains(&VerificationMethod::QrCodeScan)
            && self.ours().contains(&VerificationMethod::QrCodeShow)
    }

    /// At least one method can complete.
    pub fn any_supported(&self) -> bool {
        self.sas_supported() || self.other_can_show_qr() || self.other_can_scan_qr()
    }
}
