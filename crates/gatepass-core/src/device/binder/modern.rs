//! Modern (7+) bind flow.
//!
//! Newer portals reject a login while a session already exists for the
//! same user, and they populate the active table fast. The flow is:
//! clear leftovers, resolve the client IP, log in (directly or through
//! a short-lived script), then poll at sub-second intervals.

use gatepass_routeros::{ActiveRow, Channel, Command, DeviceEndpoint, HostRow, ScriptRow};

use super::{
    ActiveSessionInfo, BindFailure, BindRequest, BindResult, BinderConfig, ModernLoginMode,
    trap_means_already_logged_in,
};
use crate::error::CoreError;

pub(super) async fn bind(
    endpoint: &DeviceEndpoint,
    request: &BindRequest,
    config: &BinderConfig,
) -> Result<BindResult, CoreError> {
    let identifier = request.credential.identifier.as_str();
    let mut channel = Channel::open(endpoint.clone(), config.channel.clone()).await?;

    clear_existing_sessions(&mut channel, identifier).await;

    let Some(client_ip) = resolve_client_ip(&mut channel, request).await? else {
        tracing::info!(mac = %request.mac, "no host entry; client not on network");
        return Ok(BindResult::failed(BindFailure::ClientNotOnNetwork));
    };

    let method = match config.modern_login {
        ModernLoginMode::Direct => direct_login(&mut channel, request, &client_ip).await,
        ModernLoginMode::Script => scripted_login(&mut channel, request, &client_ip, config).await,
    };
    let Some(method) = method else {
        tracing::warn!(user = identifier, "every login parameterization was refused");
        return Ok(BindResult::failed(BindFailure::LoginRejected));
    };

    let session = poll_session(&mut channel, request, config).await;
    channel.close().await;
    Ok(BindResult::logged_in(method, session))
}

/// A lingering session under the same identifier makes the portal
/// refuse the new login. Clearing is best-effort.
async fn clear_existing_sessions(channel: &mut Channel, identifier: &str) {
    let rows = match channel
        .execute(&Command::new("/ip/hotspot/active/print"))
        .await
    {
        Ok(rows) => rows,
        Err(err) => {
            tracing::debug!(error = %err, "active listing failed during pre-clear");
            return;
        }
    };
    for active in rows.iter().map(ActiveRow::from_row) {
        if active.user != identifier {
            continue;
        }
        let Some(active_id) = active.id.as_deref() else {
            continue;
        };
        let remove = Command::new("/ip/hotspot/active/remove").attr("numbers", active_id);
        match channel.execute(&remove).await {
            Ok(_) => tracing::info!(user = identifier, "removed pre-existing session"),
            Err(err) => tracing::debug!(error = %err, "stale session removal failed"),
        }
    }
}

/// Client IP: caller-supplied when present, otherwise from the host
/// table, preferring the NATed to-address the portal actually sees.
async fn resolve_client_ip(
    channel: &mut Channel,
    request: &BindRequest,
) -> Result<Option<String>, CoreError> {
    let supplied = request
        .ip
        .as_deref()
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = supplied {
        return Ok(Some(ip.to_owned()));
    }

    let rows = channel
        .execute(&Command::new("/ip/hotspot/host/print"))
        .await?;
    let host = rows
        .iter()
        .map(HostRow::from_row)
        .find(|host| request.mac.matches(&host.mac_address));
    Ok(host.and_then(|host| {
        host.to_address
            .filter(|address| !address.is_empty())
            .or(host.address)
    }))
}

/// Direct login, three parameterizations. "Already logged in" traps
/// count as acceptance (the pre-clear can race a client re-attach).
async fn direct_login(
    channel: &mut Channel,
    request: &BindRequest,
    client_ip: &str,
) -> Option<String> {
    let identifier = request.credential.identifier.as_str();
    let secret = request.credential.secret.as_str();
    let mac = request.mac.as_str();

    let attempts = [
        (
            "ip-user-password",
            Command::new("/ip/hotspot/active/login")
                .attr("ip", client_ip)
                .attr("user", identifier)
                .attr("password", secret),
        ),
        (
            "user-password-mac",
            Command::new("/ip/hotspot/active/login")
                .attr("user", identifier)
                .attr("password", secret)
                .attr("mac-address", mac),
        ),
        (
            "ip-mac-user-password",
            Command::new("/ip/hotspot/active/login")
                .attr("ip", client_ip)
                .attr("mac-address", mac)
                .attr("user", identifier)
                .attr("password", secret),
        ),
    ];

    for (name, command) in attempts {
        match channel.execute(&command).await {
            Ok(_) => {
                tracing::info!(method = name, user = identifier, "hotspot login accepted");
                return Some(name.to_owned());
            }
            Err(err) => {
                if err
                    .trap_message()
                    .is_some_and(|m| trap_means_already_logged_in(m, false))
                {
                    tracing::info!(method = name, user = identifier, "session already authorized");
                    return Some(name.to_owned());
                }
                tracing::debug!(method = name, user = identifier, error = %err, "login attempt refused");
            }
        }
    }
    None
}

/// Upload-run-delete login script.
///
/// The script embeds the credential secret, so it is removed on every
/// exit path; leftovers from a crashed earlier run are swept first.
async fn scripted_login(
    channel: &mut Channel,
    request: &BindRequest,
    client_ip: &str,
    config: &BinderConfig,
) -> Option<String> {
    let name = script_name(request.mac.as_str());
    let source = login_script_source(
        &request.credential.identifier,
        &request.credential.secret,
        request.mac.as_str(),
        client_ip,
    );

    remove_script(channel, &name).await;

    let add = Command::new("/system/script/add")
        .attr("name", &name)
        .attr("source", &source);
    if let Err(err) = channel.execute(&add).await {
        tracing::warn!(script = %name, error = %err, "login script upload failed");
        return None;
    }

    let ran = run_script(channel, &name).await;
    if ran {
        tokio::time::sleep(config.timing.script_settle).await;
    }
    remove_script(channel, &name).await;

    if ran { Some("script".to_owned()) } else { None }
}

async fn run_script(channel: &mut Channel, name: &str) -> bool {
    let rows = match channel.execute(&Command::new("/system/script/print")).await {
        Ok(rows) => rows,
        Err(err) => {
            tracing::warn!(error = %err, "script listing failed");
            return false;
        }
    };
    let script_id = rows
        .iter()
        .map(ScriptRow::from_row)
        .find(|script| script.name == name)
        .and_then(|script| script.id);
    let Some(script_id) = script_id else {
        tracing::warn!(script = name, "uploaded script not found");
        return false;
    };

    let run = Command::new("/system/script/run").attr(".id", &script_id);
    match channel.execute(&run).await {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(script = name, error = %err, "script run failed");
            false
        }
    }
}

async fn remove_script(channel: &mut Channel, name: &str) {
    let rows = match channel.execute(&Command::new("/system/script/print")).await {
        Ok(rows) => rows,
        Err(err) => {
            tracing::debug!(error = %err, "script listing failed during cleanup");
            return;
        }
    };
    for script in rows.iter().map(ScriptRow::from_row) {
        if script.name != name {
            continue;
        }
        let Some(script_id) = script.id else {
            continue;
        };
        let remove = Command::new("/system/script/remove").attr("numbers", &script_id);
        if let Err(err) = channel.execute(&remove).await {
            tracing::debug!(script = name, error = %err, "script removal failed");
        }
    }
}

/// Modern portals surface sessions quickly; poll at sub-second
/// intervals instead of legacy's long windows. A MAC match wins
/// outright; an identifier match under another MAC is kept but logged.
async fn poll_session(
    channel: &mut Channel,
    request: &BindRequest,
    config: &BinderConfig,
) -> Option<ActiveSessionInfo> {
    let identifier = request.credential.identifier.as_str();

    for attempt in 1..=config.timing.poll_attempts {
        tokio::time::sleep(config.timing.poll_interval).await;
        let rows = match channel
            .execute(&Command::new("/ip/hotspot/active/print"))
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::debug!(attempt, error = %err, "active listing failed during poll");
                continue;
            }
        };
        let actives: Vec<ActiveRow> = rows.iter().map(ActiveRow::from_row).collect();

        let by_mac = actives.iter().find(|active| {
            active
                .mac_address
                .as_deref()
                .is_some_and(|mac| request.mac.matches(mac))
        });
        if let Some(active) = by_mac {
            return Some(ActiveSessionInfo::from_active(active));
        }

        let by_user = actives
            .iter()
            .find(|active| active.user.eq_ignore_ascii_case(identifier));
        if let Some(active) = by_user {
            tracing::info!(
                user = identifier,
                session_mac = ?active.mac_address,
                "session observed under a different mac"
            );
            return Some(ActiveSessionInfo::from_active(active));
        }
    }

    tracing::warn!(
        user = identifier,
        "login accepted but session never appeared in the active table"
    );
    None
}

/// Unique-enough script name: MAC plus wall clock, hashed, first 8 hex.
fn script_name(mac: &str) -> String {
    let stamp = chrono::Utc::now().timestamp();
    let digest = md5::compute(format!("{mac}_{stamp}").as_bytes());
    let hex = format!("{digest:x}");
    format!("__login_{}", &hex[..8])
}

/// RouterOS scripting source for one login, followed by a self-check
/// that lands in the device log.
fn login_script_source(user: &str, secret: &str, mac: &str, ip: &str) -> String {
    let lines = [
        format!(":local user \"{user}\""),
        format!(":local pass \"{secret}\""),
        format!(":local mac \"{mac}\""),
        format!(":local ip \"{ip}\""),
        "/ip/hotspot/active/login user=$user password=$pass ip=$ip mac-address=$mac".to_owned(),
        ":delay 2".to_owned(),
        ":if ([:len [/ip/hotspot/active/find where user=$user]] > 0) do={ :log info \"portal login ok\" } else={ :log warning \"portal login missing\" }".to_owned(),
    ];
    sanitize_script(&lines.join("\n"))
}

/// The script store mangles non-ASCII input. Transliterate accented
/// vowels, drop the rest to spaces, collapse runs, strip blank lines.
fn sanitize_script(source: &str) -> String {
    let mut ascii = String::with_capacity(source.len());
    for ch in source.chars() {
        match ch {
            'á' | 'à' | 'ä' => ascii.push('a'),
            'é' | 'è' | 'ë' => ascii.push('e'),
            'í' | 'ì' | 'ï' => ascii.push('i'),
            'ó' | 'ò' | 'ö' => ascii.push('o'),
            'ú' | 'ù' | 'ü' => ascii.push('u'),
            'ñ' => ascii.push('n'),
            'Á' | 'À' | 'Ä' => ascii.push('A'),
            'É' | 'È' | 'Ë' => ascii.push('E'),
            'Í' | 'Ì' | 'Ï' => ascii.push('I'),
            'Ó' | 'Ò' | 'Ö' => ascii.push('O'),
            'Ú' | 'Ù' | 'Ü' => ascii.push('U'),
            'Ñ' => ascii.push('N'),
            '\r' => {}
            c if c.is_ascii() => ascii.push(c),
            _ => ascii.push(' '),
        }
    }

    let mut collapsed = String::with_capacity(ascii.len());
    let mut in_run = false;
    for ch in ascii.chars() {
        if ch == ' ' {
            if !in_run {
                collapsed.push(' ');
            }
            in_run = true;
        } else {
            collapsed.push(ch);
            in_run = false;
        }
    }
    collapsed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
