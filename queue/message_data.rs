/// Canonical field names of the envelope hash at `payload:<id>`. These are
/// the wire contract; the Lua scripts spell out the same strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageField {
    Id,
    Topic,
    Priority,
    Payload,
    CreatedAt,
    ScheduledAt,
    ExpireAt,
    MaxRetries,
    Attempts,
    LastError,
    State,
    LeaseExpiresAt,
}

impl MessageField {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageField::Id => "id",
            MessageField::Topic => "topic",
            MessageField::Priority => "priority",
            MessageField::Payload => "payload",
            MessageField::CreatedAt => "created_at",
            MessageField::ScheduledAt => "scheduled_at",
            MessageField::ExpireAt => "expire_at",
            MessageField::MaxRetries => "max_retries",
            MessageField::Attempts => "attempts",
            MessageField::LastError => "last_error",
            MessageField::State => "state",
            MessageField::LeaseExpiresAt => "lease_expires_at",
        }
    }
}
