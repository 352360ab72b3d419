//! Fixed-phase tick driver tying the registry, sessions and transport together.
//!
//! Each [`SyncServer::tick`] runs, in order:
//!
//! 1. entity migration, with swap or lost notices to observing sessions;
//! 2. change propagation of this tick's edits, for every session;
//! 3. visibility passes for a round-robin slice of sessions;
//! 4. flushing every session's records, each batch ending with `TickEnd`;
//! 5. registry maintenance (periodic saves, idle unloads) and end of tick.

use std::collections::{BTreeMap, VecDeque};

use glam::DVec3;

use meridian_world::{
    ContentDefinitions, EntityKey, MaintenanceReport, RegionRegistry, RegionStore, ResourceId,
    ResourceKind, SessionId, WorldId,
};

use crate::compact::CompactId;
use crate::error::SyncError;
use crate::resource::IdSpace;
use crate::session::{Anchor, Session};
use crate::transport::Transport;
use crate::view::{BridgeGraph, ViewCircle, VisibilityPropagator};

/// Sync tuning.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Anchor circle radius, in regions.
    pub view_distance: u32,
    /// Bridge hops followed from the anchor circle.
    pub bridge_depth: u32,
    /// Squared range consumed per bridge hop.
    pub hop_penalty: i64,
    /// Sessions given a visibility pass per tick.
    pub sessions_per_tick: usize,
    /// Compact ids per category per session.
    pub compact_id_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            view_distance: 2,
            bridge_depth: 2,
            hop_penalty: 1,
            sessions_per_tick: 8,
            compact_id_limit: 65_535,
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub migrations: usize,
    pub sessions_visited: usize,
    pub records_sent: usize,
    pub maintenance: MaintenanceReport,
}

/// Owner of the world registry and every connected session.
pub struct SyncServer {
    config: SyncConfig,
    propagator: VisibilityPropagator,
    registry: RegionRegistry,
    bridges: BridgeGraph,
    content: Box<dyn ContentDefinitions>,
    sessions: BTreeMap<SessionId, Session>,
    /// Connected but never visited, served before the rotation.
    fresh: VecDeque<SessionId>,
    /// Next session in the rotation is the first id at or after this.
    cursor: u64,
    next_session: u64,
}

impl SyncServer {
    pub fn new(config: SyncConfig, registry: RegionRegistry, content: Box<dyn ContentDefinitions>) -> Self {
        Self {
            propagator: VisibilityPropagator::new(config.bridge_depth, config.hop_penalty),
            config,
            registry,
            bridges: BridgeGraph::new(),
            content,
            sessions: BTreeMap::new(),
            fresh: VecDeque::new(),
            cursor: 0,
            next_session: 1,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Simulation access to world state between ticks.
    pub fn registry_mut(&mut self) -> &mut RegionRegistry {
        &mut self.registry
    }

    pub fn bridges(&self) -> &BridgeGraph {
        &self.bridges
    }

    pub fn bridges_mut(&mut self) -> &mut BridgeGraph {
        &mut self.bridges
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // -- session lifecycle --

    /// Registers a session. It sees nothing until its first visibility pass.
    pub fn connect(&mut self, world: WorldId, position: DVec3) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let session = Session::new(id, Anchor { world, position }, self.config.compact_id_limit);
        self.sessions.insert(id, session);
        self.fresh.push_back(id);
        tracing::info!(session = ?id, ?world, "session connected");
        id
    }

    pub fn set_anchor(&mut self, id: SessionId, world: WorldId, position: DVec3) -> Result<(), SyncError> {
        let session = self.sessions.get_mut(&id).ok_or(SyncError::UnknownSession(id))?;
        session.set_anchor(Anchor { world, position });
        Ok(())
    }

    /// Tears a session down completely. Its region subscriptions are released
    /// before this returns; nothing is left for a later tick.
    pub fn disconnect(&mut self, id: SessionId) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            return false;
        };
        session.detach(&mut self.registry);
        self.fresh.retain(|s| *s != id);
        tracing::info!(session = ?id, "session disconnected");
        true
    }

    /// Sends a disconnect notice with whatever is queued, then tears down.
    pub fn kick(&mut self, id: SessionId, reason: &str, transport: &mut dyn Transport) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        tracing::warn!(session = ?id, reason, "session kicked");
        session.kick(reason);
        let tick = self.registry.tick();
        if let Err(e) = session.flush(tick, transport) {
            tracing::error!(session = ?id, error = %e, "failed to flush disconnect notice");
        }
        self.disconnect(id)
    }

    // -- client references --

    /// Server id behind a compact id the client used. An unknown id is a
    /// protocol violation and disconnects the session.
    pub fn resolve_resource(
        &mut self,
        id: SessionId,
        kind: ResourceKind,
        compact: CompactId,
        transport: &mut dyn Transport,
    ) -> Result<ResourceId, SyncError> {
        let session = self.sessions.get(&id).ok_or(SyncError::UnknownSession(id))?;
        match session.synchronizer().resources().from_compact(kind, compact) {
            Ok(resource) => Ok(resource),
            Err(e) => {
                self.kick(id, &e.to_string(), transport);
                Err(e)
            }
        }
    }

    /// Entity behind a compact id the client used. Unknown ids disconnect.
    pub fn resolve_entity(
        &mut self,
        id: SessionId,
        compact: CompactId,
        transport: &mut dyn Transport,
    ) -> Result<EntityKey, SyncError> {
        let session = self.sessions.get(&id).ok_or(SyncError::UnknownSession(id))?;
        match session.synchronizer().resources().entities().from_compact(compact) {
            Some(key) => Ok(key),
            None => {
                let e = SyncError::UnknownCompactId {
                    space: IdSpace::Entity,
                    compact,
                };
                self.kick(id, &e.to_string(), transport);
                Err(e)
            }
        }
    }

    // -- tick --

    /// Sessions given a visibility pass this tick: fresh ones first, then the
    /// rotation, at most `sessions_per_tick` in total.
    fn schedule(&mut self) -> Vec<SessionId> {
        let budget = self.config.sessions_per_tick.max(1).min(self.sessions.len());
        let mut picked = Vec::with_capacity(budget);
        while picked.len() < budget {
            let Some(id) = self.fresh.pop_front() else {
                break;
            };
            if self.sessions.contains_key(&id) {
                picked.push(id);
            }
        }
        let rotation: Vec<SessionId> = self
            .sessions
            .range(SessionId(self.cursor)..)
            .chain(self.sessions.range(..SessionId(self.cursor)))
            .map(|(id, _)| *id)
            .collect();
        for id in rotation {
            if picked.len() >= budget {
                break;
            }
            if !picked.contains(&id) {
                picked.push(id);
                self.cursor = id.0 + 1;
            }
        }
        picked
    }

    /// Runs one full tick.
    pub fn tick(&mut self, store: &mut dyn RegionStore, transport: &mut dyn Transport) -> TickReport {
        let tick = self.registry.tick();
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        let outcomes = self.registry.migrate_entities(store);
        report.migrations = outcomes.len();
        for outcome in outcomes {
            let source = outcome.source();
            let observers = self
                .registry
                .region(source.world, source.region)
                .map(|r| r.subscribers())
                .unwrap_or_default();
            for id in observers {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.on_migration(outcome);
                }
            }
        }

        for session in self.sessions.values_mut() {
            session.apply_updates(&self.registry, &*self.content);
        }

        for id in self.schedule() {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            let anchor = session.anchor();
            let circle = ViewCircle::around(anchor.world, anchor.position, self.config.view_distance);
            let circles = self.propagator.propagate(circle, &self.bridges);
            let visit = session.visit(tick, circles, &mut self.registry, store, &*self.content);
            tracing::trace!(session = ?id, ?visit, "visibility pass");
            report.sessions_visited += 1;
        }

        for session in self.sessions.values_mut() {
            match session.flush(tick, transport) {
                Ok(sent) => report.records_sent += sent,
                Err(e) => tracing::error!(session = ?session.id(), error = %e, "flush failed"),
            }
        }

        report.maintenance = self.registry.maintain(store);
        self.registry.end_tick();
        report
    }

    /// Saves every modified region. Call before shutting down.
    pub fn shutdown(&mut self, store: &mut dyn RegionStore) -> MaintenanceReport {
        let ids: Vec<_> = self.sessions.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
        self.registry.save_all(store)
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
