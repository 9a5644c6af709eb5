//! Shapes decrypted upstream XML into the line-oriented output humans
//! read. Shaping never fails: malformed input becomes a `! …` line.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{directory::Directory, message, peer};

static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^([0-9]{4})([0-9]{2})([0-9]{2})([0-9]{2})([0-9]{2})([0-9]{2})$")
        .expect("timestamp regex")
});

/// `YYYYMMDDHHMMSS` -> `DD.MM HH:MM:SS`; anything else passes through.
fn reformat_timestamp(stamp: &str) -> String {
    TIMESTAMP_RE
        .replace(stamp, "$3.$2 $4:$5:$6")
        .into_owned()
}

pub fn shape_reply(reply: &str, directory: &dyn Directory) -> String {
    let doc = match roxmltree::Document::parse(reply) {
        Ok(doc) => doc,
        Err(err) => return format!("! {err}"),
    };
    let root = doc.root_element();

    if message::has_child(root, "error_string") {
        return format!("! {}", message::child_text(root, "error_string"));
    }
    if !message::has_child(root, "answer1") {
        return "NO MATCH".to_string();
    }
    let first = message::child_text(root, "answer1");
    // legacy upstreams answer "0" or a serialized ARRAY for "done"
    if first == "0" || first.starts_with("ARRAY") {
        return "OK".to_string();
    }

    let source = message::child_text(root, "source");
    let mut lines = Vec::new();

    for answer in root
        .children()
        .filter(|c| c.is_element() && c.tag_name().name().starts_with("answer"))
    {
        let mut job = message::child_text(answer, "headertag").to_string();
        if let Some(stripped) = job.strip_prefix("trigger_action_") {
            job = stripped.to_string();
        }
        if job == "send_user_msg" {
            job = "message".to_string();
        }

        let progress = message::child_text(answer, "progress");
        let has_progress = !progress.is_empty() && progress != "none";
        let mut status = format!("{:<4}", message::child_text(answer, "status"));
        status.truncate(4);
        if status == "proc" {
            if has_progress {
                status = format!("{progress}%");
            }
        } else if has_progress {
            status.push_str(&format!("({progress}%)"));
        }

        let mut periodic = message::child_text(answer, "periodic").to_string();
        if periodic == "none" {
            periodic.clear();
        }
        if !periodic.is_empty() {
            periodic = format!(" repeated every {}", periodic.replace('_', " "));
        }

        let siserver = message::child_text(answer, "siserver");
        let mut handler = String::new();
        let mut down_note = String::new();
        if !siserver.is_empty() && siserver != "localhost" && siserver != source {
            let host = siserver.split(':').next().unwrap_or(siserver);
            let mut short = directory
                .name_for_ip(host)
                .unwrap_or_else(|| host.to_string());
            if let Some(first_label) = short.split('.').next() {
                short = first_label.to_string();
            }
            handler = format!(" [by {short}]");

            // a peer that has been unreachable cannot have run this job
            if let Some(link) = peer::peer_if_known(siserver) {
                let downtime = link.downtime();
                if !downtime.is_zero() {
                    status = "err ".to_string();
                    down_note =
                        format!(" ({short} has been down for {})", humanize(downtime));
                }
            }
        }

        lines.push(format!(
            "== {:>4} {:<9} {}  {} ({}){}{}{}",
            status,
            job,
            reformat_timestamp(message::child_text(answer, "timestamp")),
            message::child_text(answer, "macaddress"),
            message::child_text(answer, "plainname"),
            periodic,
            handler,
            down_note,
        ));
    }

    lines.join("\n")
}

fn humanize(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 120 {
        format!("{secs} seconds")
    } else if secs < 2 * 3600 {
        format!("{} minutes", secs / 60)
    } else if secs < 2 * 86400 {
        format!("{} hours", secs / 3600)
    } else {
        format!("{} days", secs / 86400)
    }
}
