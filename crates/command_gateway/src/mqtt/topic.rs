//! Topic routing for the command gateway.
//!
//! Matching is purely structural: a fixed segment count with literal
//! segments at known positions and single-level wildcards elsewhere. The
//! router is total: every topic maps to exactly one [`Route`], with
//! [`Route::Unrecognized`] as the catch-all.

/// Subscription filter for homework commands.
pub const HOMEWORK_COMMAND_FILTER: &str = "academies/+/students/+/homework/+/command";
/// Subscription filter for device commands.
pub const DEVICE_COMMAND_FILTER: &str = "academies/+/devices/+/command";
/// Subscription filter for device presence updates.
pub const DEVICE_PRESENCE_FILTER: &str = "academies/+/devices/+/presence";

/// Everything the gateway subscribes to.
pub const SUBSCRIPTION_FILTERS: [&str; 3] = [
    HOMEWORK_COMMAND_FILTER,
    DEVICE_COMMAND_FILTER,
    DEVICE_PRESENCE_FILTER,
];

/// Structured route for an inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    HomeworkCommand {
        academy_id: String,
        student_id: String,
        item_id: String,
    },
    DeviceCommand {
        academy_id: String,
        device_id: String,
    },
    DevicePresence {
        academy_id: String,
        device_id: String,
    },
    Unrecognized,
}

const WILDCARD: &str = "+";

/// One row of the route table: a segment pattern and the constructor fed
/// with the wildcard captures in order.
struct RoutePattern {
    segments: &'static [&'static str],
    build: fn(&[&str]) -> Route,
}

const ROUTE_TABLE: &[RoutePattern] = &[
    RoutePattern {
        segments: &["academies", "+", "students", "+", "homework", "+", "command"],
        build: |captures| Route::HomeworkCommand {
            academy_id: captures[0].to_string(),
            student_id: captures[1].to_string(),
            item_id: captures[2].to_string(),
        },
    },
    RoutePattern {
        segments: &["academies", "+", "devices", "+", "command"],
        build: |captures| Route::DeviceCommand {
            academy_id: captures[0].to_string(),
            device_id: captures[1].to_string(),
        },
    },
    RoutePattern {
        segments: &["academies", "+", "devices", "+", "presence"],
        build: |captures| Route::DevicePresence {
            academy_id: captures[0].to_string(),
            device_id: captures[1].to_string(),
        },
    },
];

/// Map a topic string to its route. Pure and side-effect-free; never fails
/// except by returning [`Route::Unrecognized`].
pub fn route_topic(topic: &str) -> Route {
    let parts: Vec<&str> = topic.split('/').collect();

    for pattern in ROUTE_TABLE {
        if let Some(captures) = match_segments(pattern.segments, &parts) {
            return (pattern.build)(&captures);
        }
    }

    Route::Unrecognized
}

fn match_segments<'a>(pattern: &[&str], parts: &[&'a str]) -> Option<Vec<&'a str>> {
    if pattern.len() != parts.len() {
        return None;
    }

    let mut captures = Vec::new();
    for (expected, part) in pattern.iter().zip(parts) {
        if *expected == WILDCARD {
            if part.is_empty() {
                return None;
            }
            captures.push(*part);
        } else if expected != part {
            return None;
        }
    }

    Some(captures)
}

pub fn homework_ack_topic(academy_id: &str, idempotency_key: &str) -> String {
    format!("academies/{}/ack/{}", academy_id, idempotency_key)
}

pub fn device_ack_topic(academy_id: &str, device_id: &str) -> String {
    format!("academies/{}/devices/{}/ack", academy_id, device_id)
}

pub fn homeworks_topic(academy_id: &str, device_id: &str) -> String {
    format!("academies/{}/devices/{}/homeworks", academy_id, device_id)
}

pub fn students_today_topic(academy_id: &str, device_id: &str) -> String {
    format!("academies/{}/devices/{}/students_today", academy_id, device_id)
}

pub fn student_info_topic(academy_id: &str, device_id: &str) -> String {
    format!("academies/{}/devices/{}/student_info", academy_id, device_id)
}
