use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::bridge::TerminalId;
use crate::error::{Error, Result};
use crate::session::{Session, SessionInfo, SpawnOptions};
use crate::stream::EndReason;

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Session names are `{name_prefix}_{owner}_{index}`.
    pub name_prefix: String,
    /// Upper bound on live sessions per owner.
    pub max_sessions: usize,
    pub spawn: SpawnOptions,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name_prefix: "cockpit".to_string(),
            max_sessions: 3,
            spawn: SpawnOptions::default(),
        }
    }
}

/// Result of `SessionRegistry::list`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionInfo>,
    pub count: usize,
    pub max_sessions: usize,
}

/// Owns every durable session, keyed by name.
///
/// All mutations go through one lock, so concurrent creates cannot exceed
/// the per-owner bound and an attach racing a delete either lands on a live
/// session or fails with `SessionNotFound`.
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<String, Arc<Session>>>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            config,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.config.max_sessions
    }

    /// Lock the session map, dropping sessions whose shell has exited.
    fn live_sessions(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Session>>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|name, session| {
            let alive = session.is_alive();
            if !alive {
                log::info!("Session {name} exited, removing");
            }
            alive
        });
        sessions
    }

    /// List the owner's live sessions, ordered by index.
    pub fn list(&self, owner: &str) -> SessionList {
        let sessions = self.live_sessions();
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .filter(|s| s.owner() == owner)
            .map(|s| s.info())
            .collect();
        infos.sort_by_key(|info| info.index);

        SessionList {
            count: infos.len(),
            sessions: infos,
            max_sessions: self.config.max_sessions,
        }
    }

    /// Spawn a new session for `owner` under the lowest free index.
    pub fn create(&self, owner: &str) -> Result<SessionInfo> {
        let mut sessions = self.live_sessions();

        let mut used: Vec<usize> = sessions
            .values()
            .filter(|s| s.owner() == owner)
            .map(|s| s.index())
            .collect();
        if used.len() >= self.config.max_sessions {
            return Err(Error::SessionLimit {
                max: self.config.max_sessions,
            });
        }
        used.sort_unstable();
        let index = (0..).find(|i| used.binary_search(i).is_err()).unwrap_or(used.len());

        let name = format!("{}_{}_{}", self.config.name_prefix, owner, index);
        let session = Session::spawn(name.clone(), owner.to_string(), index, &self.config.spawn)?;
        let info = session.info();
        sessions.insert(name, session);

        log::info!("Session {} created for {owner}", info.name);
        Ok(info)
    }

    /// Kill the session's process and remove it, ending any attached stream.
    pub fn delete(&self, owner: &str, name: &str) -> Result<()> {
        let session = {
            let mut sessions = self.live_sessions();
            let owned = sessions.get(name).is_some_and(|s| s.owner() == owner);
            if owned {
                sessions.remove(name)
            } else {
                None
            }
        }
        .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;

        session.close(EndReason::SessionClosed);
        log::info!("Session {name} deleted");
        Ok(())
    }

    /// Bind `terminal_id` to a session while holding the registry lock.
    pub(crate) fn attach(
        &self,
        owner: &str,
        name: &str,
        terminal_id: TerminalId,
        buffer: usize,
    ) -> Result<Arc<Session>> {
        let sessions = self.live_sessions();
        let session = sessions
            .get(name)
            .filter(|s| s.owner() == owner)
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;
        session.attach(terminal_id, buffer)?;
        Ok(Arc::clone(session))
    }

    /// Close every session. Used on host shutdown.
    pub fn shutdown(&self) {
        let sessions = std::mem::take(&mut *self.live_sessions());
        for (name, session) in sessions {
            session.close(EndReason::SessionClosed);
            log::info!("Session {name} closed on shutdown");
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::ShellCommand;

    fn registry(max_sessions: usize) -> SessionRegistry {
        SessionRegistry::new(RegistryConfig {
            max_sessions,
            spawn: SpawnOptions {
                command: ShellCommand::new("/bin/sh", &[]),
                ..SpawnOptions::default()
            },
            ..RegistryConfig::default()
        })
    }

    fn names(list: &SessionList) -> Vec<&str> {
        list.sessions.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_create_and_list_sessions() {
        let reg = registry(3);

        let first = reg.create("alice").unwrap();
        let second = reg.create("alice").unwrap();
        assert_eq!(first.name, "cockpit_alice_0");
        assert_eq!(second.name, "cockpit_alice_1");

        let list = reg.list("alice");
        assert_eq!(list.count, 2);
        assert_eq!(list.count, list.sessions.len());
        assert_eq!(list.max_sessions, 3);
        assert_eq!(names(&list), vec!["cockpit_alice_0", "cockpit_alice_1"]);
    }

    #[test]
    fn test_limit_reached() {
        let reg = registry(1);
        reg.create("alice").unwrap();

        let err = reg.create("alice").unwrap_err();
        assert!(matches!(err, Error::SessionLimit { max: 1 }));
        assert_eq!(reg.list("alice").count, 1);
    }

    #[test]
    fn test_limit_is_per_owner() {
        let reg = registry(1);
        reg.create("alice").unwrap();
        reg.create("bob").unwrap();

        assert_eq!(names(&reg.list("alice")), vec!["cockpit_alice_0"]);
        assert_eq!(names(&reg.list("bob")), vec!["cockpit_bob_0"]);
    }

    #[test]
    fn test_delete_frees_lowest_index() {
        let reg = registry(3);
        reg.create("alice").unwrap();
        reg.create("alice").unwrap();
        reg.create("alice").unwrap();

        reg.delete("alice", "cockpit_alice_1").unwrap();
        assert_eq!(
            names(&reg.list("alice")),
            vec!["cockpit_alice_0", "cockpit_alice_2"]
        );

        let again = reg.create("alice").unwrap();
        assert_eq!(again.name, "cockpit_alice_1");
    }

    #[test]
    fn test_delete_unknown_or_foreign_session() {
        let reg = registry(3);
        let info = reg.create("alice").unwrap();

        assert!(matches!(
            reg.delete("alice", "cockpit_alice_9"),
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            reg.delete("bob", &info.name),
            Err(Error::SessionNotFound(_))
        ));
        assert_eq!(reg.list("alice").count, 1);
    }

    #[test]
    fn test_attach_hides_deleted_session() {
        let reg = registry(3);
        let info = reg.create("alice").unwrap();
        assert!(reg.attach("alice", &info.name, TerminalId::new(), 8).is_ok());
        assert!(matches!(
            reg.attach("bob", &info.name, TerminalId::new(), 8),
            Err(Error::SessionNotFound(_))
        ));

        reg.delete("alice", &info.name).unwrap();
        assert!(matches!(
            reg.attach("alice", &info.name, TerminalId::new(), 8),
            Err(Error::SessionNotFound(_))
        ));
        assert!(reg.list("alice").sessions.is_empty());
    }

    #[test]
    fn test_concurrent_creates_respect_limit() {
        let reg = Arc::new(registry(2));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || reg.create("alice").is_ok())
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(created, 2);
        assert_eq!(reg.list("alice").count, 2);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let reg = registry(3);
        reg.create("alice").unwrap();
        reg.create("bob").unwrap();

        reg.shutdown();
        assert_eq!(reg.list("alice").count, 0);
        assert_eq!(reg.list("bob").count, 0);
    }
}
