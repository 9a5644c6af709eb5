//! The command catalog and the line parser. A line becomes a canonical
//! command plus a list of fully-resolved job descriptors; the evaluator
//! in `commands.rs` never sees raw tokens.

use chrono::{DateTime, Duration as ChronoDuration, Local};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::directory::Directory;

/// Surface form -> canonical form. Job commands come first so that
/// "is a job command" is an index comparison, and prefix resolution
/// picks the first surface form the input is a prefix of.
const CATALOG: &[(&str, &str)] = &[
    ("update", "update"),
    ("softupdate", "update"),
    ("reboot", "reboot"),
    ("halt", "halt"),
    ("install", "reinstall"),
    ("reinstall", "reinstall"),
    ("wakeup", "wake"),
    ("localboot", "localboot"),
    ("lock", "lock"),
    ("unlock", "activate"),
    ("activate", "activate"),
    ("send_user_msg", "send_user_msg"),
    ("msg", "send_user_msg"),
    ("message", "send_user_msg"),
    // end of the job segment
    ("help", "help"),
    ("x", "examine"),
    ("examine", "examine"),
    ("query_jobdb", "query"),
    ("query_jobs", "query"),
    ("jobs", "query"),
    ("delete_jobs", "delete"),
    ("delete_jobdb_entry", "delete"),
    ("qq", "qq"),
    ("xx", "xx"),
    ("kill", "kill"),
    (".release", ".release"),
    (".classes", ".classes"),
    (".deb", ".deb"),
    (".repo", ".deb"),
    ("raw", "raw"),
    ("encrypt", "encrypt"),
    ("decrypt", "decrypt"),
];

const JOB_COMMANDS: usize = 14;

/// Resolves an input token to its canonical command. Prefix matching,
/// except `kill`, which for safety matches only exactly.
pub fn resolve_command(input: &str) -> Option<(&'static str, bool)> {
    if input.is_empty() {
        return None;
    }
    for (i, &(surface, canonical)) in CATALOG.iter().enumerate() {
        if surface == "kill" {
            if input == "kill" {
                return Some((canonical, false));
            }
            continue;
        }
        if surface.starts_with(input) {
            return Some((canonical, i < JOB_COMMANDS));
        }
    }
    None
}

/// Resolves a job-type argument (only the job segment of the catalog).
pub fn job_type_for(prefix: &str) -> Option<&'static str> {
    if prefix.is_empty() {
        return None;
    }
    CATALOG[..JOB_COMMANDS]
        .iter()
        .find(|(surface, _)| surface.starts_with(prefix))
        .map(|(_, canonical)| *canonical)
}

/// One selected target at one time. `name == "*"` marks the wildcard
/// form, which only the query and delete families accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobDescriptor {
    pub mac: String,
    pub ip: String,
    pub name: String,
    pub date: String,
    pub time: String,
    pub job: String,
    pub sub: String,
}

impl JobDescriptor {
    pub fn has_machine(&self) -> bool {
        !self.mac.is_empty()
    }

    pub fn is_wildcard(&self) -> bool {
        self.name == "*"
    }

    pub fn timestamp(&self) -> String {
        format!("{}{}", self.date, self.time)
    }
}

#[derive(Debug)]
pub struct ParsedCommand {
    pub canonical: &'static str,
    pub is_job: bool,
    /// The new implicit list: one fully-resolved descriptor per machine.
    pub descriptors: Vec<JobDescriptor>,
    /// All substring arguments, space-joined, for raw/encrypt/decrypt.
    pub sub: String,
    /// The machine named on the left of `->`, for the copy form.
    pub copy_source: Option<JobDescriptor>,
}

static MAC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("mac regex"));
static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^20[0-9]{2}-[0-1][0-9]-[0-3][0-9]$").expect("date regex"));
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-2]?[0-9]:[0-5]?[0-9](:[0-5]?[0-9])?$").expect("time regex"));
static DURATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+[smhd]$").expect("duration regex"));

pub fn format_timestamp(when: DateTime<Local>) -> String {
    when.format("%Y%m%d%H%M%S").to_string()
}

fn parse_time(token: &str, now: DateTime<Local>, template: &mut JobDescriptor) -> bool {
    if DATE_RE.is_match(token) {
        template.date = token.replace('-', "");
        return true;
    }

    if TIME_RE.is_match(token) {
        let parts: Vec<&str> = token.split(':').collect();
        let mut normalized = format!("{:0>2}", parts[0]);
        normalized.push_str(&format!("{:0>2}", parts[1]));
        match parts.get(2) {
            Some(secs) => normalized.push_str(&format!("{:0>2}", secs)),
            None => normalized.push_str("00"),
        }
        template.time = normalized;
        return true;
    }

    if DURATION_RE.is_match(token) {
        let (digits, unit) = token.split_at(token.len() - 1);
        let n: i64 = match digits.parse() {
            Ok(n) => n,
            Err(_) => return false,
        };
        let delta = match unit {
            "s" => ChronoDuration::seconds(n),
            "m" => ChronoDuration::minutes(n),
            "h" => ChronoDuration::hours(n),
            _ => ChronoDuration::days(n),
        };
        let stamp = format_timestamp(now + delta);
        template.date = stamp[..8].to_string();
        template.time = stamp[8..].to_string();
        return true;
    }

    false
}

fn parse_machine(token: &str, directory: &dyn Directory, template: &mut JobDescriptor) -> bool {
    if token.contains('*') {
        return false;
    }

    let (mac, ip, name) = if MAC_RE.is_match(token) {
        let name = match directory.name_for_mac(token) {
            Some(name) => name,
            None => return false,
        };
        let ip = directory
            .ip_for_name(&name)
            .unwrap_or_else(|| "0.0.0.0".to_string());
        (token.to_string(), ip, name)
    } else if token.parse::<std::net::Ipv4Addr>().is_ok() {
        let name = match directory.name_for_ip(token) {
            Some(name) => name,
            None => return false,
        };
        let mac = match directory.mac_for_name(&name) {
            Some(mac) => mac,
            None => return false,
        };
        (mac, token.to_string(), name)
    } else {
        let mac = match directory.mac_for_name(token) {
            Some(mac) => mac,
            None => return false,
        };
        let ip = directory
            .ip_for_name(token)
            .unwrap_or_else(|| "0.0.0.0".to_string());
        (mac, ip, token.to_string())
    };

    template.mac = mac;
    template.ip = ip;
    template.name = name;
    true
}

fn parse_wild(token: &str, template: &mut JobDescriptor) -> bool {
    if token == "*" {
        template.mac = "*".to_string();
        template.name = "*".to_string();
        template.ip = "0.0.0.0".to_string();
        return true;
    }
    false
}

/// Rewrites the copy form so that a `machine->` prefix always ends up as
/// its own first token: `m1->wake x`, `m1 ->wake` and `m1 -> wake` all
/// become `["m1->", "wake", …]`.
fn normalize_copy_form(fields: &mut Vec<String>) {
    if let Some(idx) = fields[0].find("->") {
        if idx > 0 {
            let rest = fields[0][idx..].to_string();
            fields[0].truncate(idx);
            fields.insert(1, rest);
        }
    }
    if fields.len() > 1 && fields[1].starts_with("->") {
        let mut machine = fields.remove(0);
        machine.push_str("->");
        let mut second = fields.remove(0);
        second.replace_range(..2, "");
        fields.insert(0, machine);
        if !second.is_empty() {
            fields.insert(1, second);
        }
    }
}

/// Reverses the list when a machine reference appears before any
/// non-machine token, yielding the canonical "times/types first,
/// machines last" layout. Applying it twice is a no-op.
pub fn directional_normalize(parsed: &mut [JobDescriptor]) {
    let mut last_machine = None;
    let mut last_other = None;
    for (i, descriptor) in parsed.iter().enumerate() {
        if descriptor.has_machine() {
            last_machine = Some(i);
        } else {
            last_other = Some(i);
        }
    }
    if let (Some(machine), Some(other)) = (last_machine, last_other) {
        if other > machine {
            parsed.reverse();
        }
    }
}

/// Parses one command line. `last_targets` is the session's implicit
/// machine list; errors are complete reply lines starting with `! `.
pub fn parse_command(
    line: &str,
    now: DateTime<Local>,
    directory: &dyn Directory,
    last_targets: &[JobDescriptor],
) -> Result<ParsedCommand, String> {
    let mut fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if fields.is_empty() {
        return Err("! Empty command".to_string());
    }

    normalize_copy_form(&mut fields);

    let cmd = fields[0].to_lowercase();

    let mut copy_source = None;
    let (canonical, is_job) = if let Some(machine) = cmd.strip_suffix("->") {
        let mut template = JobDescriptor::default();
        if !parse_machine(machine, directory, &mut template) {
            return Err(format!("! Cannot find system to copy: {cmd}"));
        }
        copy_source = Some(template);
        ("copy", false)
    } else {
        match resolve_command(&cmd) {
            Some(resolved) => resolved,
            None => return Err(format!("! Unrecognized command: {cmd}")),
        }
    };

    let allow_time = is_job;
    let allow_job = canonical == "delete";
    let allow_wild = matches!(canonical, "delete" | "query" | "qq");
    let allow_sub =
        canonical.starts_with('.') || matches!(canonical, "raw" | "encrypt" | "decrypt");
    let allow_machine = !allow_sub;

    let mut parsed: Vec<JobDescriptor> = Vec::new();
    for token in &fields[1..] {
        let mut template = JobDescriptor::default();
        let lowered = token.to_lowercase();
        // machine names are tried before job types, otherwise a name
        // like "rei" would resolve to the "reinstall" job
        let matched = (allow_time && parse_time(token, now, &mut template))
            || (allow_machine && parse_machine(&lowered, directory, &mut template))
            || (allow_job && {
                match job_type_for(&lowered) {
                    Some(job) => {
                        template.job = job.to_string();
                        true
                    }
                    None => false,
                }
            })
            || (allow_wild && parse_wild(&lowered, &mut template))
            || (allow_sub && {
                template.sub = token.clone();
                !token.is_empty()
            });
        if !matched {
            return Err(format!("! Illegal argument: {token}"));
        }
        parsed.push(template);
    }

    directional_normalize(&mut parsed);

    // no explicit machines: fall back to the previous command's targets
    let have_machine = parsed.iter().any(|d| !d.name.is_empty() && d.name != "*");
    if !have_machine {
        for target in last_targets {
            if target.name != "*" {
                parsed.push(JobDescriptor {
                    mac: target.mac.clone(),
                    ip: target.ip.clone(),
                    name: target.name.clone(),
                    ..Default::default()
                });
            }
        }
    }

    // sweep left to right: time/type/sub tokens update the template, a
    // machine token is emitted with the template's current state
    let stamp = format_timestamp(now);
    let mut template = JobDescriptor {
        date: stamp[..8].to_string(),
        time: stamp[8..].to_string(),
        ..Default::default()
    };
    let mut descriptors = Vec::new();
    for item in parsed {
        if !item.job.is_empty() {
            template.job = item.job.clone();
        }
        if !item.sub.is_empty() {
            if template.sub.is_empty() {
                template.sub = item.sub.clone();
            } else {
                template.sub.push(' ');
                template.sub.push_str(&item.sub);
            }
        }
        if !item.date.is_empty() {
            template.date = item.date.clone();
        }
        if !item.time.is_empty() {
            template.time = item.time.clone();
        }
        if item.has_machine() {
            let mut descriptor = item;
            descriptor.date = template.date.clone();
            descriptor.time = template.time.clone();
            descriptor.job = template.job.clone();
            descriptor.sub = template.sub.clone();
            descriptors.push(descriptor);
        }
    }

    Ok(ParsedCommand {
        canonical,
        is_job,
        descriptors,
        sub: template.sub,
        copy_source,
    })
}
