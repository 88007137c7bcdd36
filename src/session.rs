use rand_core::{OsRng, RngCore};

/// Marker tag placed on every resource the tool creates.
pub const TAG_SEALER: &str = "Sealer";
/// Correlation id tying every resource back to one run.
pub const TAG_SESSION_ID: &str = "SealerSessionID";
/// Encryptor image a resource was produced by.
pub const TAG_ENCRYPTOR_AMI: &str = "SealerAMI";

pub const TAG_NAME: &str = "Name";
pub const TAG_DESCRIPTION: &str = "Description";

/// Short random id. Unique enough to correlate one run's resources and
/// to keep generated image names from colliding.
pub fn make_nonce() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One run of a workflow. The id is attached as a tag to every resource
/// the run creates, which is also how the cleanup sweep finds orphans.
#[derive(Clone, Debug)]
pub struct Session {
    id: String,
    encryptor_image: String,
}

impl Session {
    pub fn new(encryptor_image: &str) -> Session {
        Session {
            id: make_nonce(),
            encryptor_image: encryptor_image.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tag set applied to a resource, with optional console-facing name
    /// and description on top of the session defaults.
    pub fn tags_with(&self, name: Option<&str>, description: Option<&str>) -> Vec<(String, String)> {
        let mut tags = vec![
            (TAG_SEALER.to_string(), "true".to_string()),
            (TAG_SESSION_ID.to_string(), self.id.clone()),
            (TAG_ENCRYPTOR_AMI.to_string(), self.encryptor_image.clone()),
        ];
        if let Some(name) = name {
            tags.push((TAG_NAME.to_string(), name.to_string()));
        }
        if let Some(description) = description {
            tags.push((TAG_DESCRIPTION.to_string(), description.to_string()));
        }
        tags
    }
}
