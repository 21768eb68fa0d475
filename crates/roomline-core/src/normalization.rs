use serde::{Deserialize, Serialize};

use crate::{
    error::{ErrorCategory, RoomlineError},
    types::{RoomCommandKind, RoomNotice, TimelineItem},
};

const NOTIFICATION_BODY_MAX_CHARS: usize = 100;

/// Command result before it is turned into a presentation notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    Failure { error: RoomlineError },
}

impl From<Result<(), RoomlineError>> for CommandOutcome {
    fn from(result: Result<(), RoomlineError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(error) => Self::Failure { error },
        }
    }
}

/// Convert a command outcome into the notice shown to the user, if any.
///
/// Errors the collaborator reported without a code get one derived from
/// the command.
pub fn normalize_command_outcome(
    command: RoomCommandKind,
    outcome: CommandOutcome,
) -> Option<RoomNotice> {
    match outcome {
        CommandOutcome::Success => None,
        CommandOutcome::Failure { error } => {
            let error = if error.code.trim().is_empty() {
                classify_command_error_message(command, error.message)
            } else {
                error
            };
            Some(RoomNotice::CommandFailed {
                command,
                code: error.code,
                message: error.message,
            })
        }
    }
}

/// Convert a bare collaborator failure message to a network-classified error.
pub fn classify_command_error_message(
    command: RoomCommandKind,
    message: impl Into<String>,
) -> RoomlineError {
    let code = match command {
        RoomCommandKind::Send => "send_failed",
        RoomCommandKind::Edit => "edit_failed",
        RoomCommandKind::Delete => "redact_failed",
        RoomCommandKind::React => "react_failed",
        RoomCommandKind::Retry => "retry_failed",
        RoomCommandKind::PaginateBack => "paginate_failed",
        RoomCommandKind::MarkReadAt => "mark_read_failed",
        RoomCommandKind::SetComposerText => "typing_failed",
        RoomCommandKind::Resync => "resync_failed",
    };
    RoomlineError::new(ErrorCategory::Network, code, message.into())
}

/// Where the user's attention currently is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationContext {
    /// Conversation currently on screen.
    pub focused_room: Option<String>,
    /// Whether the application window has input focus.
    pub window_focused: bool,
}

/// Whether a new message in `room_id` should raise a notification.
pub fn should_notify(ctx: &NotificationContext, room_id: &str, sender_is_me: bool) -> bool {
    if sender_is_me {
        return false;
    }
    !(ctx.window_focused && ctx.focused_room.as_deref() == Some(room_id))
}

/// `@alice:example.org` -> `alice`.
pub fn sender_localpart(user_id: &str) -> &str {
    let trimmed = user_id.strip_prefix('@').unwrap_or(user_id);
    trimmed.split(':').next().unwrap_or(trimmed)
}

/// Build the notice for an incoming message.
pub fn incoming_notice(room_id: &str, room_name: &str, item: &TimelineItem) -> RoomNotice {
    RoomNotice::Incoming {
        room_id: room_id.to_owned(),
        event_id: item.event_id().map(ToOwned::to_owned),
        title: format!("{} in {room_name}", sender_localpart(&item.sender)),
        body: item.body.chars().take(NOTIFICATION_BODY_MAX_CHARS).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_produces_no_notice() {
        assert_eq!(
            normalize_command_outcome(RoomCommandKind::Send, Ok(()).into()),
            None
        );
    }

    #[test]
    fn maps_failure_to_notice_with_stable_error_code() {
        let notice = normalize_command_outcome(
            RoomCommandKind::React,
            CommandOutcome::Failure {
                error: RoomlineError::new(ErrorCategory::RateLimited, "rate_limited", "slow down"),
            },
        );

        match notice {
            Some(RoomNotice::CommandFailed {
                command,
                code,
                message,
            }) => {
                assert_eq!(command, RoomCommandKind::React);
                assert_eq!(code, "rate_limited");
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected notice: {other:?}"),
        }
    }

    #[test]
    fn classifies_bare_messages_as_network_errors() {
        let err = classify_command_error_message(RoomCommandKind::Delete, "boom");
        assert_eq!(err.category, ErrorCategory::Network);
        assert_eq!(err.code, "redact_failed");
    }

    #[test]
    fn uncoded_failures_get_a_command_specific_code() {
        let notice = normalize_command_outcome(
            RoomCommandKind::Edit,
            Err(RoomlineError::new(ErrorCategory::Internal, " ", "server said no")).into(),
        );
        assert_eq!(
            notice,
            Some(RoomNotice::CommandFailed {
                command: RoomCommandKind::Edit,
                code: "edit_failed".into(),
                message: "server said no".into(),
            })
        );
    }

    #[test]
    fn never_notifies_for_own_messages() {
        let ctx = NotificationContext::default();
        assert!(!should_notify(&ctx, "!a:x", true));
        assert!(should_notify(&ctx, "!a:x", false));
    }

    #[test]
    fn suppresses_focused_room_only_while_window_has_focus() {
        let mut ctx = NotificationContext {
            focused_room: Some("!a:x".into()),
            window_focused: true,
        };
        assert!(!should_notify(&ctx, "!a:x", false));
        assert!(should_notify(&ctx, "!b:x", false));

        ctx.window_focused = false;
        assert!(should_notify(&ctx, "!a:x", false));
    }

    #[test]
    fn builds_incoming_notice_with_truncated_body() {
        let item = TimelineItem::text("i", Some("$e".into()), "@alice:example.org", "x".repeat(250), 1);
        match incoming_notice("!a:x", "Team", &item) {
            RoomNotice::Incoming {
                title,
                body,
                event_id,
                ..
            } => {
                assert_eq!(title, "alice in Team");
                assert_eq!(body.chars().count(), 100);
                assert_eq!(event_id.as_deref(), Some("$e"));
            }
            other => panic!("unexpected notice: {other:?}"),
        }
    }

    #[test]
    fn localpart_tolerates_unqualified_ids() {
        assert_eq!(sender_localpart("@bob:example.org"), "bob");
        assert_eq!(sender_localpart("carol"), "carol");
    }
}
