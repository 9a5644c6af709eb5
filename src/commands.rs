//! One handler per command family. Every side-effecting branch checks
//! the session's capability record first; denials never reach the
//! upstream or the directory.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Local, NaiveDateTime};
use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

use crate::{
    access::Capabilities,
    command::{self, JobDescriptor, ParsedCommand},
    config::Config,
    directory::{self, Directory},
    encryption,
    message::{self, MsgBuilder},
    peer, render,
};

pub const PERMISSION_DENIED: &str = "! PERMISSION DENIED";

/// Reachability probe deadline for examine's port checks.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

// nothing, SSH only, client agent only, SSH+client, and the same four
// with the server agent port open
const WORKSTATION_GLYPHS: [&str; 8] = ["x_x", "o_o", "o_O", "~_^", "X_x", "^_^", "o_^", "^,^"];
const SERVER_GLYPHS: [&str; 8] = ["X_X", "O_O", "@_@", "O_@", "x_~", "^.^", "@_~", "^_~"];

const PROBE_PORTS: [u16; 3] = [22, 20083, 20081];

pub const HELP_TEXT: &str = r#"Basics:
  * Multiple commands per line are permitted if separated by ";"
  * Commands may be abbreviated to an arbitrary prefix ("wak" = "wakeup")
  * A command without machine arguments affects the machines of the most
    recent command, e.g. "examine m1 m2", then "localboot", then "wakeup"
    sets both machines to localboot and wakes both up.

Argument types:
  Machine    IP address, name, or MAC address
  "*"        (query/delete only) all machines with pending jobs
  Job type   update/softupdate, reboot, halt, install/reinstall, wakeup,
             localboot, lock, unlock/activate, send_user_msg/msg/message
  date       YYYY-MM-DD
  abs. time  HH:MM or HH:MM:SS
  rel. time  a number followed by s, m, h or d ("10m" = in ten minutes)
  substring  selects the object whose name contains it with the fewest
             extra characters; several equally good matches are an error

Times and job types may precede or follow the machines they affect, but
the two orders cannot be mixed within one command.

Commands:
  help        this text
  <job type>  schedule job(s): machines, dates, times
  examine, x  print machine state, release, classes, groups, mirrors
  xx          run "examine" repeatedly until new input arrives
  query_jobdb, query_jobs, jobs
              list pending jobs matching machines
  qq          run "query" repeatedly until new input arrives
  delete_jobs, delete_jobdb_entry
              delete matching jobs; also accepts job types; clears the
              remembered machine list
  kill        delete the directory object(s); cannot be abbreviated
  <machine>-> fill missing directory attributes from <machine>
  .release    change the release of the selected machines (substring)
  .classes    set the FAI classes (substrings, one class each)
  .deb, .repo set the repository mirrors (substrings)
  raw         send an arbitrary message; first word selects the keyword
  encrypt     like raw, but print the envelope instead of sending
  decrypt     inverse of encrypt; tries all known keys on failure
"#;

pub struct Bridge {
    pub config: Arc<Config>,
    pub directory: Arc<dyn Directory>,
    /// Upstream `host:port` this process talks to.
    pub target: String,
}

pub struct SessionState {
    pub last_targets: Vec<JobDescriptor>,
    pub capabilities: Capabilities,
}

impl SessionState {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            last_targets: Vec::new(),
            capabilities,
        }
    }
}

/// Evaluates one non-empty command line. Returns the reply text and, if
/// the command wants to be replayed, the repeat delay.
pub async fn process_line(
    bridge: &Bridge,
    state: &mut SessionState,
    line: &str,
    now: DateTime<Local>,
) -> (String, Option<Duration>) {
    // the copy form resolves its source machine while parsing, so its
    // permission check has to come before the parse
    let mut tokens = line.split_whitespace();
    let first = tokens.next().unwrap_or("");
    let second = tokens.next().unwrap_or("");
    let is_copy_form =
        first.find("->").map_or(false, |idx| idx > 0) || second.starts_with("->");
    if is_copy_form && !state.capabilities.may_edit_directory() {
        return (PERMISSION_DENIED.to_string(), None);
    }

    let parsed = match command::parse_command(
        line,
        now,
        bridge.directory.as_ref(),
        &state.last_targets,
    ) {
        Ok(parsed) => parsed,
        Err(reply) => return (reply, None),
    };
    let ParsedCommand {
        canonical,
        is_job,
        mut descriptors,
        sub,
        copy_source,
    } = parsed;

    debug!("handling command {canonical}");

    let caps = state.capabilities;
    let mut repeat = None;

    let reply = if is_job {
        for descriptor in &mut descriptors {
            descriptor.job = canonical.to_string();
        }
        state.last_targets = descriptors.clone();
        submit_jobs(bridge, caps, &descriptors).await
    } else {
        state.last_targets = descriptors.clone();
        match canonical {
            "help" => HELP_TEXT.to_string(),
            "examine" => {
                if caps.may_examine() {
                    examine_all(bridge, &descriptors).await
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            "xx" => {
                if caps.may_examine() {
                    repeat = Some(Duration::from_secs(2));
                    examine_all(bridge, &descriptors).await
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            "query" => {
                if caps.may_query() {
                    run_query(bridge, "query_jobdb", &descriptors).await
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            "qq" => {
                if caps.may_query() {
                    repeat = Some(Duration::from_secs(5));
                    run_query(bridge, "query_jobdb", &descriptors).await
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            "delete" => {
                if caps.may_modify_jobs() {
                    let echo = run_query(bridge, "query_jobdb", &descriptors)
                        .await
                        .replace("==", "<-");
                    let deleted = run_query(bridge, "delete_jobdb_entry", &descriptors).await;
                    format!("{echo}\n{deleted}")
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            "kill" => {
                if caps.may_edit_directory() {
                    command_kill(bridge, &descriptors)
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            "copy" => {
                if caps.may_edit_directory() {
                    command_copy(bridge, copy_source.as_ref(), &descriptors).await
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            ".release" => {
                if caps.may_set_fai_state() {
                    command_release(bridge, &descriptors).await
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            ".classes" => {
                if caps.may_set_fai_state() {
                    command_classes(bridge, &descriptors).await
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            ".deb" => {
                if caps.may_set_fai_state() {
                    command_repos(bridge, &descriptors).await
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            "raw" => {
                if caps.may_debug() {
                    command_raw(bridge, &sub, RawMode::Send).await
                } else {
                    PERMISSION_DENIED.to_string()
                }
            }
            "encrypt" => command_raw(bridge, &sub, RawMode::Encrypt).await,
            "decrypt" => command_raw(bridge, &sub, RawMode::Decrypt).await,
            other => format!("! Unrecognized command: {other}"),
        }
    };

    if canonical == "delete" {
        state.last_targets.clear();
    }

    (reply, repeat)
}

fn default_key(bridge: &Bridge) -> Result<String, String> {
    bridge
        .config
        .default_key()
        .map(str::to_string)
        .ok_or_else(|| {
            format!(
                "! No keyword configured for module \"{}\"",
                bridge.config.default_module
            )
        })
}

async fn ask_upstream(bridge: &Bridge, plaintext: &str, keyword: &str) -> String {
    let link = match peer::peer(&bridge.target, &bridge.config).await {
        Ok(link) => link,
        Err(err) => return message::error_reply(&bridge.config.source_name, &err),
    };
    match link.ask(plaintext, keyword).await {
        Ok(reply) => reply,
        Err(_) => message::error_reply(&bridge.config.source_name, &"ask aborted"),
    }
}

fn human_timestamp(stamp: &str) -> String {
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .map(|when| when.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| stamp.to_string())
}

async fn submit_jobs(bridge: &Bridge, caps: Capabilities, descriptors: &[JobDescriptor]) -> String {
    let keyword = match default_key(bridge) {
        Ok(keyword) => keyword,
        Err(reply) => return reply,
    };

    let mut reply = String::new();
    for job in descriptors {
        if job.is_wildcard() {
            continue;
        }
        if !reply.is_empty() {
            reply.push('\n');
        }
        reply.push_str(&format!(
            "=> {:<10} {}  {} ({})\n",
            job.job,
            human_timestamp(&job.timestamp()),
            job.mac,
            job.name
        ));

        if !caps.may_trigger(&job.job) {
            reply.push_str(PERMISSION_DENIED);
            continue;
        }

        let header = if job.job == "send_user_msg" {
            "job_send_user_msg".to_string()
        } else {
            format!("job_trigger_action_{}", job.job)
        };
        let msg = MsgBuilder::new(&header, &bridge.config.source_name, &job.mac)
            .field("macaddress", &job.mac)
            .field("timestamp", &job.timestamp())
            .finish();
        let answer = ask_upstream(bridge, &msg, &keyword).await;
        reply.push_str(&render::shape_reply(&answer, bridge.directory.as_ref()));
    }

    if reply.is_empty() {
        reply = "NO JOBS".to_string();
    }
    reply
}

async fn probe_port(ip: String, port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect((ip.as_str(), port))).await,
        Ok(Ok(_))
    )
}

async fn examine_all(bridge: &Bridge, descriptors: &[JobDescriptor]) -> String {
    let mut parts = Vec::new();
    for job in descriptors {
        if job.is_wildcard() {
            continue;
        }
        parts.push(examine_one(bridge, job).await);
    }
    parts.join("\n")
}

async fn examine_one(bridge: &Bridge, job: &JobDescriptor) -> String {
    let (ssh, client, server) = tokio::join!(
        probe_port(job.ip.clone(), PROBE_PORTS[0]),
        probe_port(job.ip.clone(), PROBE_PORTS[1]),
        probe_port(job.ip.clone(), PROBE_PORTS[2]),
    );

    let sys = match bridge.directory.system_by_mac(&job.mac) {
        Ok(sys) => sys,
        Err(err) => return format!("{}: {err}", job.name),
    };

    let gotomode = sys.attr("gotomode");
    let faistate = sys.attr("faistate");
    let faiclass = sys.attr("faiclass");
    let release = match faiclass.find(':') {
        Some(idx) => &faiclass[idx..],
        None => "unknown",
    };

    let glyph_index = ssh as usize + 2 * client as usize + 4 * server as usize;
    let glyph = if bridge.directory.is_workstation(&job.mac) {
        WORKSTATION_GLYPHS[glyph_index]
    } else {
        SERVER_GLYPHS[glyph_index]
    };

    let mut reply = format!(
        "{glyph} {gotomode} {} ({}) \"{faistate}\" {release}",
        job.mac, job.name
    );
    for class in faiclass.split_whitespace() {
        if !class.starts_with(':') {
            reply.push(' ');
            reply.push_str(class);
        }
    }

    let groups = bridge.directory.groups_with_member(&sys.dn);
    if !groups.is_empty() {
        reply.push_str("\n    inherits from:");
        for group in &groups {
            reply.push(' ');
            reply.push_str(&group.name);
        }
    }
    for mirror in sys.attr_all("faidebianmirror") {
        reply.push_str("\n    ");
        reply.push_str(mirror);
    }
    for ldap in sys.attr_all("gotoldapserver") {
        let mut stripped = ldap.as_str();
        for _ in 0..2 {
            if let Some(idx) = stripped.find(':') {
                stripped = &stripped[idx + 1..];
            }
        }
        reply.push_str("\n    ");
        reply.push_str(stripped);
    }
    for repo in sys.attr_all("fairepository") {
        let parts: Vec<&str> = repo.split('|').collect();
        if parts.len() >= 4 {
            reply.push_str(&format!(
                "\n    offers: {} {} \tURL: {}",
                parts[2], parts[3], parts[0]
            ));
        } else {
            reply.push_str("\n    ");
            reply.push_str(repo);
        }
    }

    reply
}

/// The legacy query dialect wants conjunctive normal form, so the
/// descriptor list (logically a disjunction of machine ∧ jobtype pairs)
/// is converted by branching on each descriptor's contributions. No-op
/// branches are skipped to keep the clause count down, and a wildcard
/// machine without a job type makes the whole filter empty.
fn generate_clauses(
    descriptors: &[JobDescriptor],
    idx: usize,
    machines: &mut BTreeSet<String>,
    jobtypes: &mut BTreeSet<String>,
    clauses: &mut String,
) {
    if idx == descriptors.len() {
        if machines.is_empty() && jobtypes.is_empty() {
            return;
        }
        clauses.push_str("<clause><connector>or</connector>");
        for mac in machines.iter() {
            clauses.push_str(&format!(
                "<phrase><macaddress>{}</macaddress></phrase>",
                message::escape(mac)
            ));
        }
        for jobtype in jobtypes.iter() {
            let header = if jobtype == "send_user_msg" {
                jobtype.clone()
            } else {
                format!("trigger_action_{jobtype}")
            };
            clauses.push_str(&format!("<phrase><headertag>{header}</headertag></phrase>"));
        }
        clauses.push_str("</clause>");
        return;
    }

    let job = &descriptors[idx];
    let wildcard = job.name == "*";
    let has_job = !job.job.is_empty();

    if wildcard && !has_job {
        // an always-true disjunct; no clause can constrain anything
    } else if !wildcard && has_job {
        let mut one_branch_done = false;
        if !jobtypes.contains(&job.job) {
            jobtypes.insert(job.job.clone());
            generate_clauses(descriptors, idx + 1, machines, jobtypes, clauses);
            jobtypes.remove(&job.job);
            one_branch_done = true;
        }
        let have_machine = machines.contains(&job.mac);
        if !have_machine || !one_branch_done {
            machines.insert(job.mac.clone());
            generate_clauses(descriptors, idx + 1, machines, jobtypes, clauses);
            if !have_machine {
                machines.remove(&job.mac);
            }
        }
    } else if has_job {
        let have_type = jobtypes.contains(&job.job);
        jobtypes.insert(job.job.clone());
        generate_clauses(descriptors, idx + 1, machines, jobtypes, clauses);
        if !have_type {
            jobtypes.remove(&job.job);
        }
    } else {
        let have_machine = machines.contains(&job.mac);
        machines.insert(job.mac.clone());
        generate_clauses(descriptors, idx + 1, machines, jobtypes, clauses);
        if !have_machine {
            machines.remove(&job.mac);
        }
    }
}

fn query_filter(descriptors: &[JobDescriptor]) -> String {
    let mut machines = BTreeSet::new();
    let mut jobtypes = BTreeSet::new();
    let mut clauses = String::new();
    generate_clauses(descriptors, 0, &mut machines, &mut jobtypes, &mut clauses);
    clauses
}

async fn run_query(bridge: &Bridge, header: &str, descriptors: &[JobDescriptor]) -> String {
    let keyword = match default_key(bridge) {
        Ok(keyword) => keyword,
        Err(reply) => return reply,
    };
    let source = &bridge.config.source_name;
    let msg = MsgBuilder::new(header, source, source)
        .fragment(&format!("<where>{}</where>", query_filter(descriptors)))
        .finish();
    let reply = ask_upstream(bridge, &msg, &keyword).await;
    render::shape_reply(&reply, bridge.directory.as_ref())
}

fn command_kill(bridge: &Bridge, descriptors: &[JobDescriptor]) -> String {
    let mut lines = Vec::new();
    for job in descriptors {
        if job.is_wildcard() {
            continue;
        }
        match bridge.directory.system_by_mac(&job.mac) {
            Err(err) => lines.push(format!("{}: {err}", job.name)),
            Ok(sys) => match bridge.directory.replace_system(&sys, None) {
                Err(err) => lines.push(format!("{}: {err}", job.name)),
                Ok(()) => lines.push(format!("DELETED {}", sys.dn)),
            },
        }
    }
    lines.join("\n")
}

async fn command_copy(
    bridge: &Bridge,
    copy_source: Option<&JobDescriptor>,
    descriptors: &[JobDescriptor],
) -> String {
    let source = match copy_source {
        Some(source) => source,
        None => return "! No copy source".to_string(),
    };
    let template = match bridge.directory.system_by_mac(&source.mac) {
        Ok(template) => template,
        Err(err) => return format!("{}: {err}", source.name),
    };

    let mut parts = Vec::new();
    for job in descriptors {
        if job.is_wildcard() {
            continue;
        }
        let sys = match bridge.directory.system_by_mac(&job.mac) {
            Ok(sys) => sys,
            Err(err) => {
                parts.push(format!("{}: {err}", job.name));
                continue;
            }
        };

        let mut newsys = sys.clone();
        // systems still in the incoming bucket move next to the template,
        // so the old DN is dropped and minted anew
        if !bridge.config.incoming_suffix.is_empty()
            && sys.dn.ends_with(&bridge.config.incoming_suffix)
        {
            newsys.dn.clear();
        }
        directory::fill_missing(&mut newsys, &template);
        if sys.attr("gotomode") != "active" {
            newsys.set_attr("gotomode", vec!["locked".to_string()]);
        }

        let mut part = match bridge.directory.replace_system(&sys, Some(&newsys)) {
            Err(err) => format!("{}: {err}", job.name),
            Ok(()) => format!("UPDATED {}", newsys.dn),
        };
        bridge
            .directory
            .add_to_groups(&newsys.dn, &bridge.directory.groups_with_member(&template.dn));

        part.push('\n');
        part.push_str(&examine_one(bridge, job).await);
        parts.push(part);
    }
    parts.join("\n")
}

enum BestMatch {
    None,
    One(String),
    Multiple(String),
}

/// Picks the candidate containing `sub` (case-insensitive) with the
/// fewest extra characters; several equally short matches are an error.
fn best_match(sub: &str, candidates: &[String]) -> BestMatch {
    let needle = sub.to_lowercase();
    let mut best = String::new();
    let mut listing = String::new();
    let mut best_score = usize::MAX;
    let mut multiple = false;

    for candidate in candidates {
        if !candidate.to_lowercase().contains(&needle) {
            continue;
        }
        let score = candidate.len().saturating_sub(sub.len());
        if score > best_score {
            continue;
        }
        if score == best_score && *candidate != best {
            multiple = true;
            listing.push_str(", ");
            listing.push_str(candidate);
        } else if score < best_score {
            multiple = false;
            best = candidate.clone();
            listing = best.clone();
            best_score = score;
        }
    }

    if best_score == usize::MAX {
        BestMatch::None
    } else if multiple {
        BestMatch::Multiple(listing)
    } else {
        BestMatch::One(best)
    }
}

async fn command_release(bridge: &Bridge, descriptors: &[JobDescriptor]) -> String {
    let releases = bridge.directory.releases();

    let mut parts = Vec::new();
    for job in descriptors {
        if job.is_wildcard() || job.sub.is_empty() {
            continue;
        }
        match best_match(&job.sub, &releases) {
            BestMatch::Multiple(listing) => {
                parts.push(format!(
                    "! ERROR: Multiple matches for \"{}\": {listing}",
                    job.sub
                ));
            }
            BestMatch::None => {
                parts.push(format!(
                    "! ERROR: No matches for \"{}\". Candidates: {}",
                    job.sub,
                    releases.join(", ")
                ));
            }
            BestMatch::One(release) => {
                let faiclass = bridge.directory.system_attr(&job.mac, "faiclass");
                let classes = match faiclass.find(':') {
                    Some(idx) => &faiclass[..idx],
                    None => faiclass.as_str(),
                };
                let updated = format!("{classes}:{release}");
                let mut part = match bridge.directory.set_system_attr(
                    &job.mac,
                    "faiclass",
                    vec![updated],
                ) {
                    Err(err) => format!("{}: {err}", job.name),
                    Ok(()) => format!("UPDATED {} ({})", job.name, job.mac),
                };
                part.push('\n');
                part.push_str(&examine_one(bridge, job).await);
                parts.push(part);
            }
        }
    }
    parts.join("\n")
}

async fn command_classes(bridge: &Bridge, descriptors: &[JobDescriptor]) -> String {
    let mut parts = Vec::new();
    'machines: for job in descriptors {
        if job.is_wildcard() || job.sub.is_empty() {
            continue;
        }
        let faiclass = bridge.directory.system_attr(&job.mac, "faiclass");
        let release = match faiclass.find(':') {
            Some(idx) => faiclass[idx + 1..].to_string(),
            None => {
                parts.push(format!(
                    "! ERROR: Could not determine release of {} ({})",
                    job.name, job.mac
                ));
                continue;
            }
        };
        let candidates = bridge.directory.classes_for_release(&release);

        let mut chosen = Vec::new();
        for sub in job.sub.split_whitespace() {
            match best_match(sub, &candidates) {
                BestMatch::Multiple(listing) => {
                    parts.push(format!("! ERROR: Multiple matches for \"{sub}\": {listing}"));
                    continue 'machines;
                }
                BestMatch::None => {
                    parts.push(format!(
                        "! ERROR: No matches for \"{sub}\" in release \"{release}\"."
                    ));
                    continue 'machines;
                }
                BestMatch::One(class) => chosen.push(class),
            }
        }

        let updated = format!("{} :{release}", chosen.join(" "));
        let mut part = match bridge
            .directory
            .set_system_attr(&job.mac, "faiclass", vec![updated])
        {
            Err(err) => format!("{}: {err}", job.name),
            Ok(()) => format!("UPDATED {} ({})", job.name, job.mac),
        };
        part.push('\n');
        part.push_str(&examine_one(bridge, job).await);
        parts.push(part);
    }
    parts.join("\n")
}

async fn command_repos(bridge: &Bridge, descriptors: &[JobDescriptor]) -> String {
    let mut parts = Vec::new();
    'machines: for job in descriptors {
        if job.is_wildcard() || job.sub.is_empty() {
            continue;
        }
        let faiclass = bridge.directory.system_attr(&job.mac, "faiclass");
        let release = match faiclass.find(':') {
            Some(idx) => faiclass[idx + 1..].to_string(),
            None => {
                parts.push(format!(
                    "! ERROR: Could not determine release of {} ({})",
                    job.name, job.mac
                ));
                continue;
            }
        };
        let candidates: Vec<String> = bridge
            .directory
            .repo_servers()
            .into_iter()
            .filter(|repo| repo.release == release)
            .map(|repo| repo.server)
            .collect();

        let mut mirrors = Vec::new();
        for sub in job.sub.split_whitespace() {
            match best_match(sub, &candidates) {
                BestMatch::Multiple(listing) => {
                    parts.push(format!("! ERROR: Multiple matches for \"{sub}\": {listing}"));
                    continue 'machines;
                }
                BestMatch::None => {
                    parts.push(format!(
                        "! ERROR: No matches for \"{sub}\" with release \"{release}\"."
                    ));
                    continue 'machines;
                }
                BestMatch::One(server) => mirrors.push(server),
            }
        }

        let mut part = match bridge
            .directory
            .set_system_attr(&job.mac, "faidebianmirror", mirrors)
        {
            Err(err) => format!("{}: {err}", job.name),
            Ok(()) => format!("UPDATED {} ({})", job.name, job.mac),
        };
        part.push('\n');
        part.push_str(&examine_one(bridge, job).await);
        parts.push(part);
    }
    parts.join("\n")
}

enum RawMode {
    Send,
    Encrypt,
    Decrypt,
}

/// `raw`, `encrypt` and `decrypt` share one argument convention: when
/// the first word contains no `<` and more words follow, it names either
/// a config module or a literal keyword; otherwise the default module's
/// keyword is used and the whole line is the payload.
async fn command_raw(bridge: &Bridge, sub: &str, mode: RawMode) -> String {
    let sub = sub.trim();
    let fields: Vec<&str> = sub.split_whitespace().collect();
    if fields.is_empty() {
        return "! Missing argument".to_string();
    }

    let key_token = if fields.len() == 1 || fields[0].contains('<') {
        ""
    } else {
        fields[0]
    };
    let payload = sub[key_token.len()..].trim().to_string();

    let module = if key_token.is_empty() {
        bridge.config.default_module.clone()
    } else {
        key_token.to_string()
    };
    let keyword = bridge
        .config
        .modules
        .get(&module)
        .cloned()
        .unwrap_or(module);

    let iv = bridge.config.iv();
    match mode {
        RawMode::Send => ask_upstream(bridge, &payload, &keyword).await,
        RawMode::Encrypt => encryption::encrypt(&payload, &keyword, &iv),
        RawMode::Decrypt => {
            if let Some(plain) = encryption::decrypt(&payload, &keyword, &iv) {
                return plain;
            }
            let keys = bridge.config.all_keys_for(&bridge.target);
            encryption::decrypt_with_any(&payload, keys.iter().map(String::as_str), &iv)
                .unwrap_or(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::Capabilities,
        directory::{FaiClass, InMemoryDirectory, SystemRecord},
    };
    use chrono::TimeZone;

    fn descriptor(name: &str, mac: &str, job: &str) -> JobDescriptor {
        JobDescriptor {
            mac: mac.to_string(),
            name: name.to_string(),
            ip: "0.0.0.0".to_string(),
            job: job.to_string(),
            ..Default::default()
        }
    }

    fn wildcard() -> JobDescriptor {
        JobDescriptor {
            mac: "*".into(),
            name: "*".into(),
            ip: "0.0.0.0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn machine_only_descriptors_make_one_clause() {
        let filter = query_filter(&[
            descriptor("m1", "aa:aa:aa:aa:aa:a1", ""),
            descriptor("m2", "aa:aa:aa:aa:aa:a2", ""),
        ]);
        assert_eq!(filter.matches("<clause>").count(), 1);
        assert_eq!(filter.matches("<phrase>").count(), 2);
        assert!(filter.contains("<connector>or</connector>"));
    }

    #[test]
    fn machine_and_jobtype_branch_into_cnf() {
        let filter = query_filter(&[descriptor("m1", "aa:aa:aa:aa:aa:a1", "reinstall")]);
        // (jobtype) ∧ (machine)
        assert_eq!(filter.matches("<clause>").count(), 2);
        assert!(filter.contains("<headertag>trigger_action_reinstall</headertag>"));
        assert!(filter.contains("<macaddress>aa:aa:aa:aa:aa:a1</macaddress>"));
    }

    #[test]
    fn wildcard_without_jobtype_collapses_the_filter() {
        let filter = query_filter(&[wildcard(), descriptor("m1", "aa:aa:aa:aa:aa:a1", "")]);
        assert!(filter.is_empty());
    }

    #[test]
    fn wildcard_with_jobtype_keeps_the_jobtype() {
        let mut wild = wildcard();
        wild.job = "lock".to_string();
        let filter = query_filter(&[wild]);
        assert_eq!(filter.matches("<clause>").count(), 1);
        assert!(filter.contains("<headertag>trigger_action_lock</headertag>"));
        assert!(!filter.contains("macaddress"));
    }

    #[test]
    fn send_user_msg_keeps_its_bare_headertag() {
        let mut wild = wildcard();
        wild.job = "send_user_msg".to_string();
        let filter = query_filter(&[wild]);
        assert!(filter.contains("<headertag>send_user_msg</headertag>"));
    }

    #[test]
    fn no_clause_is_ever_empty() {
        let lists: Vec<Vec<JobDescriptor>> = vec![
            vec![],
            vec![wildcard()],
            vec![descriptor("m1", "aa:aa:aa:aa:aa:a1", "update")],
            vec![
                descriptor("m1", "aa:aa:aa:aa:aa:a1", "update"),
                descriptor("m2", "aa:aa:aa:aa:aa:a2", "wake"),
            ],
        ];
        for list in lists {
            let filter = query_filter(&list);
            for clause in filter.split("</clause>").filter(|c| !c.is_empty()) {
                assert!(
                    clause.matches("<phrase>").count() >= 1,
                    "empty clause in {filter}"
                );
            }
        }
    }

    #[test]
    fn two_pairs_produce_the_full_cnf_product() {
        let filter = query_filter(&[
            descriptor("m1", "aa:aa:aa:aa:aa:a1", "update"),
            descriptor("m2", "aa:aa:aa:aa:aa:a2", "wake"),
        ]);
        assert_eq!(filter.matches("<clause>").count(), 4);
    }

    #[test]
    fn best_match_prefers_fewest_extra_characters() {
        let candidates: Vec<String> = vec!["halogen".into(), "helium".into()];
        match best_match("h", &candidates) {
            BestMatch::One(release) => assert_eq!(release, "helium"),
            _ => panic!("expected a unique match"),
        }
    }

    #[test]
    fn best_match_rejects_ties_with_a_listing() {
        let candidates: Vec<String> = vec!["helium".into(), "sodium".into()];
        match best_match("m", &candidates) {
            BestMatch::Multiple(listing) => assert_eq!(listing, "helium, sodium"),
            _ => panic!("expected a tie"),
        }
    }

    #[test]
    fn best_match_is_case_insensitive() {
        let candidates: Vec<String> = vec!["Halogen".into()];
        match best_match("HALO", &candidates) {
            BestMatch::One(release) => assert_eq!(release, "Halogen"),
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn best_match_reports_no_match() {
        let candidates: Vec<String> = vec!["halogen".into()];
        assert!(matches!(best_match("xenon", &candidates), BestMatch::None));
    }

    fn test_bridge() -> Bridge {
        let mut config = Config::default();
        config
            .modules
            .insert("jobs".into(), "first-keyword".into());
        config.modules.insert("legacy".into(), "second-keyword".into());
        config.modules.insert("extra".into(), "third-keyword".into());

        let dir = InMemoryDirectory::empty();
        dir.insert_system(SystemRecord {
            dn: "cn=dev3,ou=workstations,o=fleet".into(),
            name: "dev3".into(),
            mac: "00:0c:29:aa:bb:03".into(),
            ip: "127.0.0.1".into(),
            kind: "workstation".into(),
            ..Default::default()
        });
        dir.set_releases(vec!["halogen".into(), "helium".into()]);
        dir.set_classes(vec![FaiClass {
            name: "WEB".into(),
            release: "halogen".into(),
        }]);

        Bridge {
            config: Arc::new(config),
            directory: Arc::new(dir),
            target: "127.0.0.1:1".into(),
        }
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn decrypt_falls_back_across_all_known_keys() {
        let bridge = test_bridge();
        let iv = bridge.config.iv();
        let cipher = encryption::encrypt("<xml>hidden</xml>", "third-keyword", &iv);

        let mut state = SessionState::new(Capabilities::legacy_defaults());
        let (reply, _) =
            process_line(&bridge, &mut state, &format!("decrypt {cipher}"), noon()).await;
        assert_eq!(reply, "<xml>hidden</xml>");
    }

    #[tokio::test]
    async fn undecryptable_input_returns_verbatim() {
        let bridge = test_bridge();
        let iv = bridge.config.iv();
        let cipher = encryption::encrypt("<xml>hidden</xml>", "unknown-keyword", &iv);

        let mut state = SessionState::new(Capabilities::legacy_defaults());
        let (reply, _) =
            process_line(&bridge, &mut state, &format!("decrypt {cipher}"), noon()).await;
        assert_eq!(reply, cipher);
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_round_trips_through_the_session() {
        let bridge = test_bridge();
        let mut state = SessionState::new(Capabilities::legacy_defaults());
        let (envelope, _) =
            process_line(&bridge, &mut state, "encrypt <xml>ping</xml>", noon()).await;
        let (reply, _) =
            process_line(&bridge, &mut state, &format!("decrypt {envelope}"), noon()).await;
        assert_eq!(reply, "<xml>ping</xml>");
    }

    #[tokio::test]
    async fn denied_sessions_get_the_literal_reply() {
        let bridge = test_bridge();
        let mut state = SessionState::new(Capabilities::default());
        for line in [
            "examine dev3",
            "query",
            "kill dev3",
            ".release halo",
            "raw <xml></xml>",
            "dev3->dev3",
        ] {
            let (reply, _) = process_line(&bridge, &mut state, line, noon()).await;
            assert_eq!(reply, PERMISSION_DENIED, "{line}");
        }
    }

    #[tokio::test]
    async fn release_tie_leaves_the_machine_unchanged() {
        let bridge = test_bridge();
        // equally long candidates that both contain "um"
        let dir = InMemoryDirectory::empty();
        dir.insert_system(SystemRecord {
            dn: "cn=dev3,ou=workstations,o=fleet".into(),
            name: "dev3".into(),
            mac: "00:0c:29:aa:bb:03".into(),
            ip: "127.0.0.1".into(),
            kind: "workstation".into(),
            ..Default::default()
        });
        dir.set_releases(vec!["barium".into(), "cerium".into()]);
        dir.set_system_attr("00:0c:29:aa:bb:03", "faiclass", vec!["WEB :argon".into()])
            .unwrap();
        let bridge = Bridge {
            config: Arc::clone(&bridge.config),
            directory: Arc::new(dir),
            target: bridge.target.clone(),
        };

        let mut state = SessionState::new(Capabilities::legacy_defaults());
        let (_, _) = process_line(&bridge, &mut state, "examine dev3", noon()).await;
        let (reply, _) = process_line(&bridge, &mut state, ".release um", noon()).await;
        assert_eq!(reply, "! ERROR: Multiple matches for \"um\": barium, cerium");
        assert_eq!(
            bridge.directory.system_attr("00:0c:29:aa:bb:03", "faiclass"),
            "WEB :argon"
        );
    }

    #[tokio::test]
    async fn help_lists_every_command_family() {
        let bridge = test_bridge();
        let mut state = SessionState::new(Capabilities::default());
        let (reply, repeat) = process_line(&bridge, &mut state, "help", noon()).await;
        assert!(repeat.is_none());
        for needle in ["examine", "query_jobdb", "kill", ".release", "decrypt"] {
            assert!(reply.contains(needle), "help must mention {needle}");
        }
    }

    #[tokio::test]
    async fn examine_prints_mode_mac_name_state_release_and_classes() {
        let bridge = test_bridge();
        let mac = "00:0c:29:aa:bb:03";
        bridge
            .directory
            .set_system_attr(mac, "gotomode", vec!["active".into()])
            .unwrap();
        bridge
            .directory
            .set_system_attr(mac, "faistate", vec!["install".into()])
            .unwrap();
        bridge
            .directory
            .set_system_attr(mac, "faiclass", vec!["WEB DB :halogen".into()])
            .unwrap();
        bridge
            .directory
            .set_system_attr(mac, "faidebianmirror", vec!["http://mirror/a".into()])
            .unwrap();

        let mut state = SessionState::new(Capabilities::legacy_defaults());
        let (reply, _) = process_line(&bridge, &mut state, "examine dev3", noon()).await;
        assert!(
            reply.contains("active 00:0c:29:aa:bb:03 (dev3) \"install\" :halogen WEB DB"),
            "{reply}"
        );
        assert!(reply.contains("\n    http://mirror/a"), "{reply}");
    }

    #[tokio::test]
    async fn delete_clears_the_implicit_list() {
        let bridge = test_bridge();
        let mut state = SessionState::new(Capabilities::legacy_defaults());
        let (_, _) = process_line(&bridge, &mut state, "examine dev3", noon()).await;
        assert_eq!(state.last_targets.len(), 1);
        // the ask fails fast against the closed test port; the implicit
        // list must be cleared regardless
        let (_, _) = process_line(&bridge, &mut state, "delete dev3", noon()).await;
        assert!(state.last_targets.is_empty());
    }

    #[tokio::test]
    async fn repeat_is_requested_by_qq_and_xx_only() {
        let bridge = test_bridge();
        let mut state = SessionState::new(Capabilities::legacy_defaults());
        let (_, repeat) = process_line(&bridge, &mut state, "examine dev3", noon()).await;
        assert!(repeat.is_none());
        let (_, repeat) = process_line(&bridge, &mut state, "xx dev3", noon()).await;
        assert_eq!(repeat, Some(Duration::from_secs(2)));
        let (_, repeat) = process_line(&bridge, &mut state, "qq dev3", noon()).await;
        assert_eq!(repeat, Some(Duration::from_secs(5)));
    }
}
