//! Mock infrastructure for simulating a managed topology in functional
//! tests.
//!
//! ## Design Philosophy
//!
//! Instead of duplicating production logic, these mocks:
//! 1. Simulate only the external world (servers, their GTID state, the
//!    metadata rows)
//! 2. Route every operation through the production trait seams
//!    (`Topology`, `ServerOps`, `Metadata`, `Prompter`, `Console`)
//! 3. Record the effects so tests can assert on what the engine did
//!
//! This keeps the tests in sync with production behavior automatically.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use semver::Version;
use serde_json::Value;

use mysql_admin::client::probe::{GroupMember, MemberRole, ProbeError, Topology};
use mysql_admin::client::server_ops::ServerOps;
use mysql_admin::client::session::{CR_CONN_HOST_ERROR, SessionError};
use mysql_admin::client::types::{
    GtidSet, InstanceAddress, InstanceSnapshot, MemberState, ReplicationChannelStatus,
    ServerVersion,
};
use mysql_admin::controller::context::{ClusterContext, Console};
use mysql_admin::controller::membership::{Cluster, CreateClusterOptions};
use mysql_admin::controller::prompter::{Confirmation, Prompter};
use mysql_admin::controller::repl_options::ReplicationOptions;
use mysql_admin::metadata::types::{ClusterRecord, InstanceRecord, RouterRecord};
use mysql_admin::metadata::{Metadata, MetadataError};

/// One simulated server.
#[derive(Debug, Clone)]
pub struct ServerSim {
    pub snapshot: InstanceSnapshot,
    pub reachable: bool,
    /// Whether the server shows up in the group membership view.
    pub in_group: bool,
    /// Users the server's channels currently authenticate with.
    pub channel_users: Vec<String>,
}

/// The simulated world state shared by all mock seams.
#[derive(Default)]
pub struct WorldState {
    pub servers: BTreeMap<String, ServerSim>,
    pub primary: String,
    /// (user, host) pairs created, in order.
    pub created_accounts: Vec<(String, String)>,
    /// (user, host) pairs dropped, in order.
    pub dropped_accounts: Vec<(String, String)>,
    /// (address, name, value) sysvar writes.
    pub sysvars: Vec<(String, String, String)>,
    /// Every channel/clone action, in order, as "<verb> <address>".
    pub ops_log: Vec<String>,
    /// Force the next START REPLICA to fail server-side.
    pub fail_start_channel: bool,
    /// Clone leaves the target unreachable (simulates a restart that never
    /// finishes).
    pub clone_hangs_restart: bool,
    /// Probes currently in flight, and the high-water mark. The engine
    /// contacts servers one at a time, so the mark must stay at 1.
    pub probes_in_flight: usize,
    pub max_probes_in_flight: usize,
}

/// Handle to the simulated world.
#[derive(Clone, Default)]
pub struct World(pub Arc<Mutex<WorldState>>);

pub fn snapshot(address: &str, uuid: &str, server_id: u32, gtid: &str) -> InstanceSnapshot {
    InstanceSnapshot {
        address: address.parse().unwrap(),
        server_uuid: uuid.to_string(),
        server_id,
        version: ServerVersion::parse("8.0.32").unwrap(),
        report_host: None,
        member_state: MemberState::Online,
        gtid_executed: GtidSet::parse(gtid).unwrap(),
        gtid_purged: GtidSet::default(),
        channels: Vec::new(),
    }
}

impl World {
    pub fn add_server(&self, sim: ServerSim) {
        let address = sim.snapshot.address.to_string();
        self.0.lock().unwrap().servers.insert(address, sim);
    }

    pub fn set_primary(&self, address: &str) {
        self.0.lock().unwrap().primary = address.to_string();
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let mut state = self.0.lock().unwrap();
        if let Some(server) = state.servers.get_mut(address) {
            server.reachable = reachable;
        }
    }

    pub fn set_channel(&self, address: &str, channel: ReplicationChannelStatus) {
        let mut state = self.0.lock().unwrap();
        if let Some(server) = state.servers.get_mut(address) {
            server.snapshot.channels = vec![channel];
        }
    }

    pub fn set_member_state(&self, address: &str, member_state: MemberState) {
        let mut state = self.0.lock().unwrap();
        if let Some(server) = state.servers.get_mut(address) {
            server.snapshot.member_state = member_state;
            server.in_group = member_state != MemberState::Offline;
        }
    }

    pub fn set_in_group(&self, address: &str, in_group: bool) {
        let mut state = self.0.lock().unwrap();
        if let Some(server) = state.servers.get_mut(address) {
            server.in_group = in_group;
        }
    }

    pub fn set_channel_users(&self, address: &str, users: &[&str]) {
        let mut state = self.0.lock().unwrap();
        if let Some(server) = state.servers.get_mut(address) {
            server.channel_users = users.iter().map(|u| u.to_string()).collect();
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.0.lock().unwrap().ops_log.clone()
    }

    pub fn max_concurrent_probes(&self) -> usize {
        self.0.lock().unwrap().max_probes_in_flight
    }

    pub fn created_accounts(&self) -> Vec<(String, String)> {
        self.0.lock().unwrap().created_accounts.clone()
    }

    pub fn dropped_accounts(&self) -> Vec<(String, String)> {
        self.0.lock().unwrap().dropped_accounts.clone()
    }

    pub fn sysvars_for(&self, address: &str) -> Vec<(String, String)> {
        self.0
            .lock()
            .unwrap()
            .sysvars
            .iter()
            .filter(|(a, _, _)| a == address)
            .map(|(_, n, v)| (n.clone(), v.clone()))
            .collect()
    }
}

fn unreachable_error(address: &InstanceAddress) -> SessionError {
    SessionError::Connect {
        address: address.to_string(),
        code: CR_CONN_HOST_ERROR,
        message: format!("Can't connect to MySQL server on '{}'", address),
    }
}

/// Topology seam over the simulated world.
pub struct MockTopology {
    pub world: World,
}

#[async_trait]
impl Topology for MockTopology {
    async fn probe(&self, address: &InstanceAddress) -> Result<InstanceSnapshot, ProbeError> {
        {
            let mut state = self.world.0.lock().unwrap();
            state.probes_in_flight += 1;
            state.max_probes_in_flight =
                state.max_probes_in_flight.max(state.probes_in_flight);
        }
        // Suspend once so overlapping probes are observable in the
        // high-water mark.
        tokio::task::yield_now().await;
        let result = {
            let state = self.world.0.lock().unwrap();
            match state.servers.get(&address.to_string()) {
                Some(server) if server.reachable => Ok(server.snapshot.clone()),
                _ => Err(ProbeError::Session(unreachable_error(address))),
            }
        };
        self.world.0.lock().unwrap().probes_in_flight -= 1;
        result
    }

    async fn members(&self, via: &InstanceAddress) -> Result<Vec<GroupMember>, ProbeError> {
        let state = self.world.0.lock().unwrap();
        if !state
            .servers
            .get(&via.to_string())
            .is_some_and(|s| s.reachable)
        {
            return Err(ProbeError::Session(unreachable_error(via)));
        }
        Ok(state
            .servers
            .values()
            .filter(|s| s.in_group)
            .map(|s| GroupMember {
                server_uuid: s.snapshot.server_uuid.clone(),
                address: s.snapshot.address.clone(),
                state: s.snapshot.member_state,
                role: if s.snapshot.address.to_string() == state.primary {
                    MemberRole::Primary
                } else {
                    MemberRole::Secondary
                },
            })
            .collect())
    }
}

/// Server-side effect seam. Mutates the simulated world the way the real
/// statements would mutate servers.
pub struct MockServerOps {
    pub world: World,
}

impl MockServerOps {
    fn check_reachable(
        state: &WorldState,
        address: &InstanceAddress,
    ) -> Result<(), SessionError> {
        match state.servers.get(&address.to_string()) {
            Some(server) if server.reachable => Ok(()),
            _ => Err(unreachable_error(address)),
        }
    }
}

#[async_trait]
impl ServerOps for MockServerOps {
    async fn create_recovery_account(
        &self,
        at: &InstanceAddress,
        user: &str,
        allowed_host: &str,
        _password: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        state
            .created_accounts
            .push((user.to_string(), allowed_host.to_string()));
        Ok(())
    }

    async fn drop_account(
        &self,
        at: &InstanceAddress,
        user: &str,
        host: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        state
            .dropped_accounts
            .push((user.to_string(), host.to_string()));
        Ok(())
    }

    async fn set_sysvar(
        &self,
        at: &InstanceAddress,
        name: &str,
        value: &str,
        _persist: bool,
    ) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        state
            .sysvars
            .push((at.to_string(), name.to_string(), value.to_string()));
        Ok(())
    }

    async fn get_sysvar(
        &self,
        at: &InstanceAddress,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        let state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        Ok(state
            .sysvars
            .iter()
            .rev()
            .find(|(a, n, _)| a == &at.to_string() && n == name)
            .map(|(_, _, v)| v.clone()))
    }

    async fn clone_instance(
        &self,
        target: &InstanceAddress,
        donor: &InstanceAddress,
        _user: &str,
        _password: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, target)?;
        state
            .ops_log
            .push(format!("CLONE {} FROM {}", target, donor));

        let donor_state = state
            .servers
            .get(&donor.to_string())
            .map(|s| (s.snapshot.gtid_executed.clone(), s.snapshot.gtid_purged.clone()));
        let hang = state.clone_hangs_restart;
        if let (Some((executed, purged)), Some(server)) =
            (donor_state, state.servers.get_mut(&target.to_string()))
        {
            server.snapshot.gtid_executed = executed;
            server.snapshot.gtid_purged = purged;
            server.snapshot.member_state = MemberState::Online;
            server.in_group = true;
            if hang {
                server.reachable = false;
            }
        }
        Ok(())
    }

    async fn configure_channel(
        &self,
        at: &InstanceAddress,
        channel: &str,
        source: &InstanceAddress,
        user: &str,
        _password: &str,
        options: &ReplicationOptions,
    ) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        state
            .ops_log
            .push(format!("CONFIGURE {} channel '{}'", at, channel));
        let channel_status = ReplicationChannelStatus {
            channel_name: channel.to_string(),
            source: Some(source.clone()),
            user: user.to_string(),
            io_running: false,
            sql_running: false,
            last_error_number: 0,
            last_error_message: String::new(),
            options: options.clone(),
        };
        if let Some(server) = state.servers.get_mut(&at.to_string()) {
            server.snapshot.channels = vec![channel_status];
            server.channel_users = vec![user.to_string()];
        }
        Ok(())
    }

    async fn start_channel(
        &self,
        at: &InstanceAddress,
        channel: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        if state.fail_start_channel {
            return Err(SessionError::Server {
                code: 3092,
                message: "The server is not configured properly to be an active member \
                          of the group"
                    .to_string(),
            });
        }
        state.ops_log.push(format!("START {} channel '{}'", at, channel));

        // Starting the channel replicates everything the primary has.
        let primary_gtid = state
            .servers
            .get(&state.primary)
            .map(|s| s.snapshot.gtid_executed.clone());
        if let (Some(gtid), Some(server)) =
            (primary_gtid, state.servers.get_mut(&at.to_string()))
        {
            server.snapshot.gtid_executed = server.snapshot.gtid_executed.union(&gtid);
            server.snapshot.member_state = MemberState::Online;
            server.in_group = true;
            if let Some(c) = server.snapshot.channels.first_mut() {
                c.io_running = true;
                c.sql_running = true;
            }
        }
        Ok(())
    }

    async fn stop_channel(&self, at: &InstanceAddress, channel: &str) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        state.ops_log.push(format!("STOP {} channel '{}'", at, channel));
        Ok(())
    }

    async fn reset_channel(&self, at: &InstanceAddress, channel: &str) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        state.ops_log.push(format!("RESET {} channel '{}'", at, channel));
        if let Some(server) = state.servers.get_mut(&at.to_string()) {
            server.snapshot.channels.clear();
        }
        Ok(())
    }

    async fn set_as_primary(
        &self,
        via: &InstanceAddress,
        member_uuid: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, via)?;
        state
            .ops_log
            .push(format!("SET_PRIMARY {} via {}", member_uuid, via));
        let new_primary = state
            .servers
            .values()
            .find(|s| s.snapshot.server_uuid == member_uuid)
            .map(|s| s.snapshot.address.to_string());
        if let Some(address) = new_primary {
            state.primary = address;
        }
        Ok(())
    }

    async fn stop_group_replication(&self, at: &InstanceAddress) -> Result<(), SessionError> {
        let mut state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        state.ops_log.push(format!("STOP_GR {}", at));
        if let Some(server) = state.servers.get_mut(&at.to_string()) {
            server.in_group = false;
            server.snapshot.member_state = MemberState::Offline;
        }
        Ok(())
    }

    async fn channel_users(&self, at: &InstanceAddress) -> Result<Vec<String>, SessionError> {
        let state = self.world.0.lock().unwrap();
        Self::check_reachable(&state, at)?;
        Ok(state
            .servers
            .get(&at.to_string())
            .map(|s| s.channel_users.clone())
            .unwrap_or_default())
    }
}

/// In-memory metadata store state, inspectable after the context moves.
#[derive(Default)]
pub struct MetaState {
    pub schema_version: Option<Version>,
    pub cluster: Option<ClusterRecord>,
    pub instances: Vec<InstanceRecord>,
    pub routers: Vec<RouterRecord>,
}

#[derive(Clone, Default)]
pub struct MetaHandle(pub Arc<Mutex<MetaState>>);

impl MetaHandle {
    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.0.lock().unwrap().instances.clone()
    }

    pub fn instance(&self, address: &str) -> Option<InstanceRecord> {
        self.0
            .lock()
            .unwrap()
            .instances
            .iter()
            .find(|r| r.address == address)
            .cloned()
    }

    pub fn add_router(&self, router: RouterRecord) {
        self.0.lock().unwrap().routers.push(router);
    }

    pub fn set_schema_version(&self, version: Version) {
        self.0.lock().unwrap().schema_version = Some(version);
    }

    pub fn routers(&self) -> Vec<RouterRecord> {
        self.0.lock().unwrap().routers.clone()
    }
}

/// In-memory [`Metadata`] implementation.
pub struct MemoryMetadata {
    pub state: MetaHandle,
}

#[async_trait]
impl Metadata for MemoryMetadata {
    async fn schema_version(&mut self) -> Result<Version, MetadataError> {
        Ok(self
            .state
            .0
            .lock()
            .unwrap()
            .schema_version
            .clone()
            .unwrap_or_else(|| Version::new(2, 3, 0)))
    }

    async fn cluster(&mut self) -> Result<ClusterRecord, MetadataError> {
        self.state
            .0
            .lock()
            .unwrap()
            .cluster
            .clone()
            .ok_or(MetadataError::ClusterNotFound)
    }

    async fn create_cluster(&mut self, record: &ClusterRecord) -> Result<(), MetadataError> {
        self.state.0.lock().unwrap().cluster = Some(record.clone());
        Ok(())
    }

    async fn update_cluster_attribute(
        &mut self,
        key: &str,
        value: &Value,
    ) -> Result<(), MetadataError> {
        let mut state = self.state.0.lock().unwrap();
        let cluster = state.cluster.as_mut().ok_or(MetadataError::ClusterNotFound)?;
        cluster.attributes.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn instances(&mut self) -> Result<Vec<InstanceRecord>, MetadataError> {
        Ok(self.state.0.lock().unwrap().instances.clone())
    }

    async fn insert_instance(&mut self, record: &InstanceRecord) -> Result<(), MetadataError> {
        self.state.0.lock().unwrap().instances.push(record.clone());
        Ok(())
    }

    async fn remove_instance(&mut self, address: &str) -> Result<(), MetadataError> {
        let mut state = self.state.0.lock().unwrap();
        let before = state.instances.len();
        state.instances.retain(|r| r.address != address);
        if state.instances.len() == before {
            return Err(MetadataError::InstanceNotFound(address.to_string()));
        }
        Ok(())
    }

    async fn update_instance_label(
        &mut self,
        address: &str,
        label: &str,
    ) -> Result<(), MetadataError> {
        let mut state = self.state.0.lock().unwrap();
        let record = state
            .instances
            .iter_mut()
            .find(|r| r.address == address)
            .ok_or_else(|| MetadataError::InstanceNotFound(address.to_string()))?;
        record.label = label.to_string();
        Ok(())
    }

    async fn update_instance_uuid(
        &mut self,
        address: &str,
        server_uuid: &str,
    ) -> Result<(), MetadataError> {
        let mut state = self.state.0.lock().unwrap();
        let record = state
            .instances
            .iter_mut()
            .find(|r| r.address == address)
            .ok_or_else(|| MetadataError::InstanceNotFound(address.to_string()))?;
        record.server_uuid = server_uuid.to_string();
        Ok(())
    }

    async fn update_instance_attribute(
        &mut self,
        address: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), MetadataError> {
        let mut state = self.state.0.lock().unwrap();
        let record = state
            .instances
            .iter_mut()
            .find(|r| r.address == address)
            .ok_or_else(|| MetadataError::InstanceNotFound(address.to_string()))?;
        record.attributes.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove_instance_attribute(
        &mut self,
        address: &str,
        key: &str,
    ) -> Result<(), MetadataError> {
        let mut state = self.state.0.lock().unwrap();
        let record = state
            .instances
            .iter_mut()
            .find(|r| r.address == address)
            .ok_or_else(|| MetadataError::InstanceNotFound(address.to_string()))?;
        record.attributes.remove(key);
        Ok(())
    }

    async fn routers(&mut self) -> Result<Vec<RouterRecord>, MetadataError> {
        Ok(self.state.0.lock().unwrap().routers.clone())
    }

    async fn remove_router(&mut self, router_id: u64) -> Result<(), MetadataError> {
        let mut state = self.state.0.lock().unwrap();
        let before = state.routers.len();
        state.routers.retain(|r| r.router_id != router_id);
        if state.routers.len() == before {
            return Err(MetadataError::RouterNotFound(router_id.to_string()));
        }
        Ok(())
    }

    async fn drop_cluster(&mut self) -> Result<(), MetadataError> {
        let mut state = self.state.0.lock().unwrap();
        state.instances.clear();
        state.cluster = None;
        Ok(())
    }
}

/// Prompter scripted with fixed answers.
pub struct ScriptedPrompter {
    pub confirm_answer: Confirmation,
    pub choose_answer: Option<usize>,
    pub questions: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPrompter {
    pub fn declining() -> Self {
        Self {
            confirm_answer: Confirmation::No,
            choose_answer: None,
            questions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn confirming() -> Self {
        Self {
            confirm_answer: Confirmation::Yes,
            choose_answer: Some(0),
            questions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn confirm(&self, question: &str, _default_yes: bool) -> Confirmation {
        self.questions.lock().unwrap().push(question.to_string());
        self.confirm_answer
    }

    async fn choose(&self, question: &str, _choices: &[&str]) -> Option<usize> {
        self.questions.lock().unwrap().push(question.to_string());
        self.choose_answer
    }
}

/// Console capturing all output lines.
#[derive(Default)]
pub struct CapturingConsole {
    pub lines: Arc<Mutex<Vec<String>>>,
}

impl Console for CapturingConsole {
    fn info(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }

    fn warning(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }
}

/// Handles kept by a test after the context is moved into the cluster.
pub struct Fixture {
    pub world: World,
    pub meta: MetaHandle,
    pub console: Arc<Mutex<Vec<String>>>,
    pub questions: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    pub fn console_text(&self) -> String {
        self.console.lock().unwrap().join("\n")
    }
}

/// Route engine logs through the test harness so failures carry context.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,mysql_admin=debug")
        .with_test_writer()
        .try_init();
}

/// Build a context over fresh mocks. `interactive` also controls whether the
/// scripted prompter confirms or declines.
pub fn context_with(
    world: &World,
    meta: &MetaHandle,
    prompter: ScriptedPrompter,
    interactive: bool,
) -> (ClusterContext, Fixture) {
    init_tracing();
    let console = CapturingConsole::default();
    let fixture = Fixture {
        world: world.clone(),
        meta: meta.clone(),
        console: console.lines.clone(),
        questions: prompter.questions.clone(),
    };
    let context = ClusterContext::new(
        Box::new(MemoryMetadata { state: meta.clone() }),
        Arc::new(MockTopology {
            world: world.clone(),
        }),
        Arc::new(MockServerOps {
            world: world.clone(),
        }),
        Arc::new(prompter),
        Arc::new(console),
    )
    .interactive(interactive);
    (context, fixture)
}

/// A single-member cluster seeded at `db1:3306`, the most common starting
/// point.
pub async fn seeded_cluster(gtid_set_is_complete: bool) -> (Cluster, Fixture) {
    let world = World::default();
    world.add_server(ServerSim {
        snapshot: snapshot("db1:3306", "uuid-1", 11, "8a94f357-aab4-11df-86ab-c80aa9429562:1-50"),
        reachable: true,
        in_group: true,
        channel_users: Vec::new(),
    });
    world.set_primary("db1:3306");

    let meta = MetaHandle::default();
    let (context, fixture) = context_with(&world, &meta, ScriptedPrompter::declining(), false);
    let cluster = Cluster::create(
        context,
        "testCluster",
        &"db1:3306".parse().unwrap(),
        CreateClusterOptions {
            gtid_set_is_complete,
            ..CreateClusterOptions::default()
        },
    )
    .await
    .expect("cluster creation");
    (cluster, fixture)
}

/// A live channel row with the managed channel name and given options.
pub fn live_channel(user: &str, options: ReplicationOptions) -> ReplicationChannelStatus {
    ReplicationChannelStatus {
        channel_name: "group_replication_recovery".to_string(),
        source: Some("db1:3306".parse().unwrap()),
        user: user.to_string(),
        io_running: true,
        sql_running: true,
        last_error_number: 0,
        last_error_message: String::new(),
        options,
    }
}
