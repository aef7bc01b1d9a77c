use crate::error::{Result, SwarmError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::net::{IpAddr, SocketAddr};

/// A logged-in user of the point-to-point server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyUser {
    /// Address of the control connection
    pub client_addr: SocketAddr,
    /// Port the user accepts PING/FETCH on; zero until announced
    pub listen_port: u16,
}

impl LegacyUser {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.client_addr.ip(), self.listen_port)
    }
}

/// One holder of a file: `[username, ip, listen_port]` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder(pub String, pub IpAddr, pub u16);

impl Holder {
    pub fn username(&self) -> &str {
        &self.0
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.1, self.2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Valid,
    Invalid,
}

impl Registration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Registration::Valid => "Valid",
            Registration::Invalid => "Invalid",
        }
    }
}

/// `username -> user` and `file name -> holders`
#[derive(Debug, Default)]
pub struct LegacyRegistry {
    users: BTreeMap<String, LegacyUser>,
    files: BTreeMap<String, Vec<Holder>>,
}

impl LegacyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `username`. Taken or empty names are `Invalid`.
    pub fn register(&mut self, username: &str, client_addr: SocketAddr) -> Registration {
        if username.is_empty() || self.users.contains_key(username) {
            return Registration::Invalid;
        }
        self.users.insert(
            username.to_string(),
            LegacyUser {
                client_addr,
                listen_port: 0,
            },
        );
        Registration::Valid
    }

    pub fn set_listen_port(&mut self, username: &str, listen_port: u16) -> Result<()> {
        let user = self.user_mut(username)?;
        user.listen_port = listen_port;
        Ok(())
    }

    pub fn user(&self, username: &str) -> Option<&LegacyUser> {
        self.users.get(username)
    }

    /// Record `username` as holding `file`
    pub fn publish(&mut self, username: &str, file: &str) -> Result<()> {
        let user = *self.user_mut(username)?;
        let holder = Holder(username.to_string(), user.client_addr.ip(), user.listen_port);

        let holders = self.files.entry(file.to_string()).or_default();
        if !holders.iter().any(|h| h.username() == username) {
            holders.push(holder);
        }
        Ok(())
    }

    /// A user finished fetching `file` and now holds it too
    pub fn inform(&mut self, username: &str, file: &str) -> Result<()> {
        self.publish(username, file)
    }

    pub fn fetch(&self, file: &str) -> Vec<Holder> {
        self.files.get(file).cloned().unwrap_or_default()
    }

    /// Remove a user and every file entry pointing at them
    pub fn remove(&mut self, username: &str) -> bool {
        if self.users.remove(username).is_none() {
            return false;
        }

        for holders in self.files.values_mut() {
            holders.retain(|h| h.username() != username);
        }
        self.files.retain(|_, holders| !holders.is_empty());
        true
    }

    /// End of a control connection: remove `username` only while it still
    /// belongs to the session at `client_addr`
    pub fn remove_session(&mut self, username: &str, client_addr: SocketAddr) -> bool {
        match self.users.get(username) {
            Some(user) if user.client_addr == client_addr => self.remove(username),
            _ => false,
        }
    }

    /// Files held by `username`
    pub fn discover(&self, username: &str) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, holders)| holders.iter().any(|h| h.username() == username))
            .map(|(file, _)| file.clone())
            .collect()
    }

    pub fn list_all(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    /// Human-readable summary, terminated by an empty line
    pub fn scrape_report(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "Number of peers online: {}", self.users.len());
        let _ = writeln!(report, "Online peers with their files:");

        for username in self.users.keys() {
            let files = self.discover(username);
            let listing = if files.is_empty() {
                "No files".to_string()
            } else {
                files.join(", ")
            };
            let _ = writeln!(report, "[{}]: {}", username, listing);
        }

        report.push('\n');
        report
    }

    fn user_mut(&mut self, username: &str) -> Result<&mut LegacyUser> {
        self.users
            .get_mut(username)
            .ok_or_else(|| SwarmError::NotFound(format!("User {} not found", username)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn registry_with(users: &[&str]) -> LegacyRegistry {
        let mut registry = LegacyRegistry::new();
        for (i, name) in users.iter().enumerate() {
            assert_eq!(registry.register(name, addr(5000 + i as u16)), Registration::Valid);
            registry.set_listen_port(name, 6000 + i as u16).unwrap();
        }
        registry
    }

    #[test]
    fn test_duplicate_username_is_invalid() {
        let mut registry = registry_with(&["thanh"]);
        assert_eq!(registry.register("thanh", addr(1)), Registration::Invalid);
        assert_eq!(registry.register("", addr(1)), Registration::Invalid);
        assert_eq!(registry.list_all(), vec!["thanh".to_string()]);
    }

    #[test]
    fn test_publish_and_fetch() {
        let mut registry = registry_with(&["a", "b"]);
        registry.publish("a", "x.txt").unwrap();
        registry.publish("a", "x.txt").unwrap();
        registry.inform("b", "x.txt").unwrap();

        let holders = registry.fetch("x.txt");
        assert_eq!(holders.len(), 2);
        assert_eq!(holders[0].addr(), addr(6000));
        assert!(registry.fetch("y.txt").is_empty());
        assert!(matches!(registry.publish("ghost", "x.txt"), Err(SwarmError::NotFound(_))));
    }

    #[test]
    fn test_holder_wire_shape() {
        let holder = Holder("a".to_string(), "127.0.0.1".parse().unwrap(), 4402);
        assert_eq!(serde_json::to_string(&vec![holder]).unwrap(), r#"[["a","127.0.0.1",4402]]"#);
    }

    #[test]
    fn test_remove_purges_files() {
        let mut registry = registry_with(&["a", "b"]);
        registry.publish("a", "only-a").unwrap();
        registry.publish("a", "shared").unwrap();
        registry.publish("b", "shared").unwrap();

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.fetch("only-a").is_empty());
        assert_eq!(registry.fetch("shared").len(), 1);
        assert!(registry.discover("a").is_empty());
    }

    #[test]
    fn test_stale_session_keeps_new_owner() {
        let mut registry = registry_with(&["a"]);
        // Evicted by a failed ping, then the name is taken again
        assert!(registry.remove("a"));
        assert_eq!(registry.register("a", addr(7000)), Registration::Valid);
        registry.publish("a", "file").unwrap();

        assert!(!registry.remove_session("a", addr(5000)));
        assert_eq!(registry.list_all(), vec!["a".to_string()]);
        assert_eq!(registry.fetch("file").len(), 1);

        assert!(registry.remove_session("a", addr(7000)));
        assert!(registry.list_all().is_empty());
    }

    #[test]
    fn test_scrape_report_format() {
        let mut registry = registry_with(&["a", "b"]);
        registry.publish("a", "one").unwrap();
        registry.publish("a", "two").unwrap();

        let expected = concat!(
            "Number of peers online: 2\n",
            "Online peers with their files:\n",
            "[a]: one, two\n",
            "[b]: No files\n\n",
        );
        assert_eq!(registry.scrape_report(), expected);
    }
}
