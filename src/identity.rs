use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, warn};

use crate::remote::RemoteSession;

/// uid/gid to name maps, loaded once per control connection.
#[derive(Clone, Debug, Default)]
pub struct IdentityCache {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl IdentityCache {
    pub fn load(remote: &mut dyn RemoteSession) -> Result<Self> {
        let users = fetch_db(remote, "passwd")?;
        let groups = fetch_db(remote, "group")?;
        let cache = Self {
            users: parse_db(&users),
            groups: parse_db(&groups),
        };
        debug!(
            users = cache.users.len(),
            groups = cache.groups.len(),
            "Identity cache loaded"
        );
        Ok(cache)
    }

    pub fn from_tables(passwd: &str, group: &str) -> Self {
        Self {
            users: parse_db(passwd),
            groups: parse_db(group),
        }
    }

    /// Unknown ids come back as their decimal form.
    pub fn user(&self, uid: u32) -> String {
        self.users
            .get(&uid)
            .cloned()
            .unwrap_or_else(|| uid.to_string())
    }

    pub fn group(&self, gid: u32) -> String {
        self.groups
            .get(&gid)
            .cloned()
            .unwrap_or_else(|| gid.to_string())
    }
}

fn fetch_db(remote: &mut dyn RemoteSession, db: &str) -> Result<String> {
    let out = remote.exec(&format!("getent {db} 2>/dev/null || cat /etc/{db}"))?;
    if !out.success() {
        warn!(db, code = out.exit_code, "Could not read identity database");
    }
    Ok(out.stdout)
}

/// `name:x:id:...` lines, the layout shared by passwd and group.
fn parse_db(text: &str) -> HashMap<u32, String> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?.trim();
            let _password = fields.next()?;
            let id = fields.next()?.trim().parse::<u32>().ok()?;
            if name.is_empty() {
                return None;
            }
            Some((id, name.to_string()))
        })
        .collect()
}
