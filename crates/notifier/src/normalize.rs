//! Display-block synthesis for data-only payloads.
//!
//! Some platforms only surface a notification to the user when a display block
//! is present. Before dispatch, a data-only payload gets a title/body from:
//! 1. explicit data fields (`title`/`body`, then `alert_title`/`alert_body`)
//! 2. the `type` rule table below
//! 3. a bare `message` field
//!
//! If nothing matches, the payload stays data-only.

use std::collections::BTreeMap;

use pulse_common::types::{DisplayBlock, NotificationPayload};

/// Data keys consulted, in order, for the notification type.
const TYPE_KEYS: &[&str] = &["type", "event_type", "alert_type"];

/// Title used when only a bare `message` field is available.
const GENERIC_TITLE: &str = "New notification";

/// A type→display rule. Placeholders are `{field}` or `{field|fallback}`.
struct Template {
    kind: &'static str,
    title: &'static str,
    body: &'static str,
}

const TEMPLATES: &[Template] = &[
    Template {
        kind: "fall_detected",
        title: "Fall detected",
        body: "{patient_name|Someone you care for} may have fallen. Check on them now.",
    },
    Template {
        kind: "sos_triggered",
        title: "SOS alert",
        body: "{patient_name|Someone you care for} pressed their SOS button.",
    },
    Template {
        kind: "vital_out_of_range",
        title: "Vital sign alert",
        body: "{patient_name|Your patient}'s {metric|vital sign} reading of {value|an unusual value} is outside the safe range.",
    },
    Template {
        kind: "heart_rate_alert",
        title: "Heart rate alert",
        body: "{patient_name|Your patient}'s heart rate is {value|outside the safe range} bpm.",
    },
    Template {
        kind: "medication_reminder",
        title: "Medication reminder",
        body: "It's time to take {medication|your medication}.",
    },
    Template {
        kind: "medication_missed",
        title: "Missed medication",
        body: "{patient_name|Your patient} has not confirmed {medication|a scheduled dose}.",
    },
    Template {
        kind: "device_offline",
        title: "Device offline",
        body: "{device_name|A monitoring device} has stopped reporting.",
    },
    Template {
        kind: "low_battery",
        title: "Low battery",
        body: "{device_name|A monitoring device} is running low on battery.",
    },
    Template {
        kind: "caregiver_invite",
        title: "Caregiver invitation",
        body: "{inviter_name|Someone} invited you to join their care circle.",
    },
    Template {
        kind: "subscription_expiring",
        title: "Subscription expiring",
        body: "Your monitoring plan expires {expires_on|soon}.",
    },
    Template {
        kind: "payment_failed",
        title: "Payment failed",
        body: "We could not process your latest payment. Update your billing details to keep monitoring active.",
    },
];

/// Return `payload` with a synthesized display block when it is data-only.
pub fn normalize(mut payload: NotificationPayload) -> NotificationPayload {
    if !payload.is_data_only() {
        return payload;
    }

    if let Some(display) = synthesize_display(&payload.data) {
        let image = payload.notification.take().and_then(|n| n.image);
        payload.notification = Some(DisplayBlock { image, ..display });
    }

    payload
}

/// Build a display block from data fields alone, or `None` if no rule applies.
pub fn synthesize_display(data: &BTreeMap<String, String>) -> Option<DisplayBlock> {
    if let Some(display) = explicit_fields(data, "title", "body") {
        return Some(display);
    }
    if let Some(display) = explicit_fields(data, "alert_title", "alert_body") {
        return Some(display);
    }

    let kind = TYPE_KEYS
        .iter()
        .find_map(|key| non_blank(data, key))
        .map(str::to_ascii_lowercase);

    if let Some(template) = kind
        .as_deref()
        .and_then(|kind| TEMPLATES.iter().find(|t| t.kind == kind))
    {
        return Some(DisplayBlock::new(
            render(template.title, data),
            render(template.body, data),
        ));
    }

    non_blank(data, "message").map(|message| DisplayBlock::new(GENERIC_TITLE, message))
}

fn explicit_fields(
    data: &BTreeMap<String, String>,
    title_key: &str,
    body_key: &str,
) -> Option<DisplayBlock> {
    let title = non_blank(data, title_key);
    let body = non_blank(data, body_key);
    if title.is_none() && body.is_none() {
        return None;
    }
    Some(DisplayBlock::new(
        title.unwrap_or_default(),
        body.unwrap_or_default(),
    ))
}

fn non_blank<'a>(data: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    data.get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

/// Substitute `{field}` / `{field|fallback}` placeholders from `data`.
fn render(template: &str, data: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let placeholder = &after[..end];
        let (key, fallback) = placeholder.split_once('|').unwrap_or((placeholder, ""));
        out.push_str(non_blank(data, key.trim()).unwrap_or(fallback));

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn data_only(pairs: &[(&str, &str)]) -> NotificationPayload {
        NotificationPayload {
            data: data(pairs),
            ..NotificationPayload::default()
        }
    }

    #[test]
    fn test_existing_display_block_untouched() {
        let payload = NotificationPayload {
            notification: Some(DisplayBlock::new("Hello", "World")),
            data: data(&[("type", "fall_detected")]),
            ..NotificationPayload::default()
        };
        assert_eq!(normalize(payload.clone()), payload);
    }

    #[test]
    fn test_explicit_title_body_fields_win() {
        let payload = normalize(data_only(&[
            ("title", "Check-in"),
            ("body", "Daily check-in is due"),
            ("type", "fall_detected"),
        ]));
        let display = payload.notification.unwrap();
        assert_eq!(display.title, "Check-in");
        assert_eq!(display.body, "Daily check-in is due");
    }

    #[test]
    fn test_alert_fields_used_when_title_missing() {
        let display =
            synthesize_display(&data(&[("alert_title", "Heads up"), ("alert_body", "")])).unwrap();
        assert_eq!(display.title, "Heads up");
        assert_eq!(display.body, "");
    }

    #[test]
    fn test_fall_detected_template_interpolates() {
        let payload = normalize(data_only(&[
            ("type", "fall_detected"),
            ("patient_name", "Margaret"),
        ]));
        let display = payload.notification.unwrap();
        assert_eq!(display.title, "Fall detected");
        assert_eq!(
            display.body,
            "Margaret may have fallen. Check on them now."
        );
        assert_eq!(payload.data.get("type").unwrap(), "fall_detected");
    }

    #[test]
    fn test_template_fallbacks_for_missing_fields() {
        let display = synthesize_display(&data(&[("event_type", "VITAL_OUT_OF_RANGE")])).unwrap();
        assert_eq!(display.title, "Vital sign alert");
        assert_eq!(
            display.body,
            "Your patient's vital sign reading of an unusual value is outside the safe range."
        );
    }

    #[test]
    fn test_bare_message_gets_generic_title() {
        let display = synthesize_display(&data(&[("message", "Your report is ready")])).unwrap();
        assert_eq!(display.title, GENERIC_TITLE);
        assert_eq!(display.body, "Your report is ready");
    }

    #[test]
    fn test_unknown_type_stays_data_only() {
        let payload = normalize(data_only(&[("type", "silent_sync"), ("cursor", "42")]));
        assert!(payload.notification.is_none());
        assert!(payload.is_data_only());
    }

    #[test]
    fn test_blank_display_block_replaced_keeping_image() {
        let payload = NotificationPayload {
            notification: Some(DisplayBlock {
                title: String::new(),
                body: String::new(),
                image: Some("https://cdn.example/alert.png".to_string()),
            }),
            data: data(&[("type", "sos_triggered")]),
            ..NotificationPayload::default()
        };
        let display = normalize(payload).notification.unwrap();
        assert_eq!(display.title, "SOS alert");
        assert_eq!(display.image.as_deref(), Some("https://cdn.example/alert.png"));
    }

    #[test]
    fn test_render_leaves_unclosed_brace() {
        assert_eq!(render("value {oops", &BTreeMap::new()), "value {oops");
    }
}
