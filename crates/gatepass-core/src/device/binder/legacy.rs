//! Legacy (pre-7) bind flow.
//!
//! Old portals are quirky about which login parameterization they
//! accept, and sessions take seconds to show up in the active table.
//! The flow leans on redundancy: pin the MAC to the user record, keep
//! the cookie table consistent, try up to four login shapes, then
//! verify across two long windows.

use gatepass_routeros::{ActiveRow, Channel, Command, CookieRow, DeviceEndpoint, HostRow, UserRow};

use super::{
    ActiveSessionInfo, BindFailure, BindRequest, BindResult, BinderConfig,
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

    // The device user must exist before anything gets bound to it.
    let rows = channel
        .execute(&Command::new("/ip/hotspot/user/print"))
        .await?;
    let user = rows
        .iter()
        .map(UserRow::from_row)
        .find(|user| user.name == identifier);
    let Some(user) = user else {
        tracing::warn!(user = identifier, "bind target user not found on device");
        return Ok(BindResult::failed(BindFailure::UserNotFound));
    };

    // Pin the client MAC onto the record. Portals use it for cookie
    // re-auth; a refusal here degrades, not fails.
    if let Some(user_id) = user.id.as_deref() {
        let pin = Command::new("/ip/hotspot/user/set")
            .attr(".id", user_id)
            .attr("mac-address", request.mac.as_str());
        if let Err(err) = channel.execute(&pin).await {
            tracing::debug!(user = identifier, error = %err, "mac pinning refused");
        }
    }

    // No host entry means the client is not attached; a login attempt
    // for a detached client would only poison the portal state.
    let rows = channel
        .execute(&Command::new("/ip/hotspot/host/print"))
        .await?;
    let host = rows
        .iter()
        .map(HostRow::from_row)
        .find(|host| request.mac.matches(&host.mac_address));
    let Some(host) = host else {
        tracing::info!(mac = %request.mac, "no host entry; client not on network");
        return Ok(BindResult::failed(BindFailure::ClientNotOnNetwork));
    };
    let host_ip = host.address.clone();

    reconcile_cookie(&mut channel, request, identifier).await;

    let method = try_logins(&mut channel, request, &host, host_ip.as_deref()).await;
    let Some(method) = method else {
        tracing::warn!(user = identifier, "every login parameterization was refused");
        return Ok(BindResult::failed(BindFailure::LoginRejected));
    };

    let session = verify_session(&mut channel, request, host_ip.as_deref(), config).await;
    channel.close().await;
    Ok(BindResult::logged_in(method, session))
}

/// Keep the cookie table consistent: at most one cookie per MAC, and
/// only for the current user. A stale cookie (same MAC, different
/// user) is removed; a missing one is created. Cookie trouble never
/// fails the bind.
async fn reconcile_cookie(channel: &mut Channel, request: &BindRequest, identifier: &str) {
    let rows = match channel
        .execute(&Command::new("/ip/hotspot/cookie/print"))
        .await
    {
        Ok(rows) => rows,
        Err(err) => {
            tracing::debug!(error = %err, "cookie listing failed");
            return;
        }
    };
    let existing = rows
        .iter()
        .map(CookieRow::from_row)
        .find(|cookie| request.mac.matches(&cookie.mac_address));

    match existing {
        Some(cookie) if !cookie.user.eq_ignore_ascii_case(identifier) => {
            let Some(cookie_id) = cookie.id.as_deref() else {
                return;
            };
            let remove = Command::new("/ip/hotspot/cookie/remove").attr(".id", cookie_id);
            match channel.execute(&remove).await {
                Ok(_) => {
                    tracing::debug!(mac = %request.mac, stale_user = %cookie.user, "stale cookie removed");
                }
                Err(err) => tracing::debug!(error = %err, "stale cookie removal failed"),
            }
        }
        Some(_) => {}
        None => {
            let add = Command::new("/ip/hotspot/cookie/add")
                .attr("mac-address", request.mac.as_str())
                .attr("user", identifier);
            if let Err(err) = channel.execute(&add).await {
                tracing::debug!(error = %err, "cookie add failed");
            }
        }
    }
}

/// Try login parameterizations in order; the first accepted one wins.
/// "Already logged in" traps count as acceptance.
async fn try_logins(
    channel: &mut Channel,
    request: &BindRequest,
    host: &HostRow,
    host_ip: Option<&str>,
) -> Option<String> {
    let identifier = request.credential.identifier.as_str();
    let secret = request.credential.secret.as_str();
    let mac = request.mac.as_str();

    let mut attempts: Vec<(&str, Command, bool)> = Vec::new();
    if let Some(ip) = host_ip {
        attempts.push((
            "ip-user-password",
            Command::new("/ip/hotspot/active/login")
                .attr("ip", ip)
                .attr("user", identifier)
                .attr("password", secret),
            false,
        ));
        attempts.push((
            "mac-ip-user-password",
            Command::new("/ip/hotspot/active/login")
                .attr("mac-address", mac)
                .attr("ip", ip)
                .attr("user", identifier)
                .attr("password", secret),
            false,
        ));
    }
    if let (Some(_), Some(host_id)) = (host.server.as_deref(), host.id.as_deref()) {
        attempts.push((
            "host-offset-user",
            Command::new("/ip/hotspot/active/login")
                .attr("numbers", host_id)
                .attr("user", identifier),
            false,
        ));
    }
    if let Some(ip) = host_ip {
        // Last resort; loose about what counts as "already in".
        attempts.push((
            "ip-mac-user-password",
            Command::new("/ip/hotspot/active/login")
                .attr("ip", ip)
                .attr("mac-address", mac)
                .attr("user", identifier)
                .attr("password", secret),
            true,
        ));
    }

    for (name, command, loose) in attempts {
        match channel.execute(&command).await {
            Ok(_) => {
                tracing::info!(method = name, user = identifier, "hotspot login accepted");
                return Some(name.to_owned());
            }
            Err(err) => {
                if err
                    .trap_message()
                    .is_some_and(|m| trap_means_already_logged_in(m, loose))
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

/// Two verification windows. The first accepts a match on MAC, lease
/// IP, or user name; the second drops the name match, which can alias
/// a session on another device.
async fn verify_session(
    channel: &mut Channel,
    request: &BindRequest,
    host_ip: Option<&str>,
    config: &BinderConfig,
) -> Option<ActiveSessionInfo> {
    let identifier = request.credential.identifier.as_str();

    tokio::time::sleep(config.timing.verify_after).await;
    if let Ok(rows) = channel
        .execute(&Command::new("/ip/hotspot/active/print"))
        .await
    {
        let found = rows.iter().map(ActiveRow::from_row).find(|active| {
            matches_client(active, request, host_ip) || active.user.eq_ignore_ascii_case(identifier)
        });
        if let Some(active) = found {
            return Some(ActiveSessionInfo::from_active(&active));
        }
    }

    tokio::time::sleep(config.timing.verify_retry_after).await;
    if let Ok(rows) = channel
        .execute(&Command::new("/ip/hotspot/active/print"))
        .await
    {
        let found = rows
            .iter()
            .map(ActiveRow::from_row)
            .find(|active| matches_client(active, request, host_ip));
        if let Some(active) = found {
            return Some(ActiveSessionInfo::from_active(&active));
        }
    }

    tracing::warn!(
        user = identifier,
        "login accepted but session never appeared in the active table"
    );
    None
}

fn matches_client(active: &ActiveRow, request: &BindRequest, host_ip: Option<&str>) -> bool {
    if active
        .mac_address
        .as_deref()
        .is_some_and(|mac| request.mac.matches(mac))
    {
        return true;
    }
    host_ip.is_some() && active.address.as_deref() == host_ip
}
