use std::fmt;

use uuid::Uuid;

/// Time-ordered UUID v7 newtypes, one per kind of chat record.
macro_rules! chat_ids {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, formatter)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    )+};
}

chat_ids! {
    SessionId,
    MessageId,
    /// Minted per send; tells a live response apart from earlier ones on the same session.
    RequestId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_version_seven_and_unique() {
        let first = MessageId::new_v7();
        let second = MessageId::new_v7();

        assert_ne!(first, second);
        assert_eq!(Uuid::from(first).get_version_num(), 7);
    }

    #[test]
    fn display_matches_the_hyphenated_uuid() {
        let session_id = SessionId::new_v7();
        assert_eq!(
            session_id.to_string(),
            Uuid::from(session_id).hyphenated().to_string()
        );
    }
}
