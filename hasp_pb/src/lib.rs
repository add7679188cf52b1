#![doc = include_str!("../README.md")]

use prototk_derive::Message;

use rpc_pb::{service, ClientID, Context, Host, HostID};

use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The method name the lock manager registers for replicated acquires.
pub const ACQUIRE: &str = "acquire";
/// The method name the lock manager registers for replicated releases.
pub const RELEASE: &str = "release";

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The service error shared by every hasp RPC surface.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(606208, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(606209, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        err: prototk::Error,
        /// Additional context for what was happening.
        #[prototk(3, string)]
        context: String,
    },
    /// There was an error at the RPC layer.
    #[prototk(606210, message)]
    TransportFailure {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The RPC error.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// The request must be made to the primary and this replica is not it.
    #[prototk(606211, message)]
    NotPrimary {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// The replica is mid-view-change or mid-sync; retry later.
    #[prototk(606212, message)]
    Busy {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// A replicated invoke landed somewhere it never should have.
    #[prototk(606213, message)]
    Misdirected {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// A replicated invoke carried a view stamp other than the one expected next.
    #[prototk(606214, message)]
    StaleViewStamp {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The view stamp this replica expects next.
        #[prototk(2, message)]
        want: ViewStamp,
        /// The view stamp the request carried.
        #[prototk(3, message)]
        got: ViewStamp,
    },
    /// The acceptor log does not check out.
    #[prototk(606215, message)]
    Corruption {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// An OS/IO error.
    #[prototk(606216, message)]
    SystemError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The string representation of the error.
        #[prototk(2, string)]
        what: String,
    },
}

impl Error {
    /// A fresh NotPrimary error.
    pub fn not_primary() -> Self {
        Self::NotPrimary {
            core: ErrorCore::default(),
        }
    }

    /// A fresh Busy error.
    pub fn busy() -> Self {
        Self::Busy {
            core: ErrorCore::default(),
        }
    }

    /// A fresh Misdirected error.
    pub fn misdirected(what: impl Into<String>) -> Self {
        Self::Misdirected {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    /// A fresh Corruption error.
    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }
}

impl Default for Error {
    fn default() -> Error {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(err: buffertk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            err: err.into(),
            context: "buffertk unpack error".to_string(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(err: prototk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            err,
            context: "prototk unpack error".to_string(),
        }
    }
}

impl From<rpc_pb::Error> for Error {
    fn from(err: rpc_pb::Error) -> Error {
        Error::TransportFailure {
            core: ErrorCore::default(),
            what: err,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::SystemError {
            core: ErrorCore::default(),
            what: format!("{}", err),
        }
    }
}

iotoz! {Error}

impl From<Error> for indicio::Value {
    fn from(err: Error) -> Self {
        indicio::value!({
            error: format!("{}", err),
        })
    }
}

////////////////////////////////////////////// Ballot //////////////////////////////////////////////

/// Ballots order competing proposals.  A ballot is the ordered pair of (number, leader), where
/// only the listed leader is allowed to issue proposals under the ballot, so no two nodes ever
/// work the synod protocol under the same ballot.
///
/// Ballots are comparable.  When `ballot1` < `ballot2`, we say ballot2 supersedes ballot1.  The
/// comparison is lexicographic by (number, leader), which ensures that a proposer whose ballot is
/// superseded by a competing proposer can select another ballot to supersede either of the first
/// two.
#[derive(Clone, Debug, Eq, Hash, Message, PartialEq, PartialOrd, Ord)]
pub struct Ballot {
    #[prototk(1, uint64)]
    pub number: u64,
    #[prototk(2, message)]
    pub leader: HostID,
}

impl Ballot {
    /// The smallest possible ballot.
    pub const BOTTOM: Ballot = Ballot {
        number: 0,
        leader: HostID::BOTTOM,
    };

    /// The ballot that supersedes every ballot `<= other` with `leader` at the helm.
    pub fn superseding(other: &Ballot, leader: HostID) -> Self {
        Self {
            number: other.number + 1,
            leader,
        }
    }
}

impl Default for Ballot {
    fn default() -> Self {
        Self::BOTTOM
    }
}

impl From<Ballot> for indicio::Value {
    fn from(ballot: Ballot) -> Self {
        indicio::value!({
            number: ballot.number,
            leader: ballot.leader.prefix_free_readable(),
        })
    }
}

///////////////////////////////////////////// ViewStamp ////////////////////////////////////////////

/// A view stamp tags each replicated request with the view it executes in and its sequence within
/// that view.  Replicas execute requests in view-stamp order with no gaps.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, PartialEq, PartialOrd, Ord)]
pub struct ViewStamp {
    #[prototk(1, uint64)]
    pub vid: u64,
    #[prototk(2, uint64)]
    pub seqno: u64,
}

impl ViewStamp {
    /// The view stamp of the next request within the same view.
    pub fn next(&self) -> Self {
        Self {
            vid: self.vid,
            seqno: self.seqno + 1,
        }
    }
}

impl From<ViewStamp> for indicio::Value {
    fn from(vs: ViewStamp) -> Self {
        indicio::value!({
            vid: vs.vid,
            seqno: vs.seqno,
        })
    }
}

/////////////////////////////////////////////// View ///////////////////////////////////////////////

/// A view is one decided membership configuration.  The view's vid is the Paxos instance that
/// decided it; views are totally ordered by vid and the history of views has no gaps.
#[derive(Clone, Default, Eq, Message, PartialEq)]
pub struct View {
    /// The Paxos instance this view was decided at.
    #[prototk(1, uint64)]
    pub vid: u64,
    /// The members of this view.  Order is not significant; "smallest" member always means
    /// smallest HostID.
    #[prototk(2, message)]
    pub members: Vec<Host>,
}

impl View {
    /// Is the provided host a member of this view.
    pub fn is_member(&self, host: HostID) -> bool {
        self.members.iter().any(|m| m.host_id() == host)
    }

    /// The full Host record for a member.
    pub fn member(&self, host: HostID) -> Option<&Host> {
        self.members.iter().find(|m| m.host_id() == host)
    }

    /// The member with the smallest HostID.
    pub fn smallest_member(&self) -> Option<&Host> {
        self.members.iter().min_by_key(|m| m.host_id())
    }

    /// The number of hosts that constitutes a majority of this view.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        let members: Vec<String> = self.members.iter().map(|m| m.to_string()).collect();
        f.debug_struct("View")
            .field("vid", &self.vid)
            .field("members", &members)
            .finish()
    }
}

impl From<View> for indicio::Value {
    fn from(view: View) -> Self {
        let members: Vec<indicio::Value> = view
            .members
            .iter()
            .map(|m| indicio::Value::from(m.clone()))
            .collect();
        indicio::value!({
            vid: view.vid,
            members: indicio::Value::from(members),
        })
    }
}

////////////////////////////////////////////// ViewLog /////////////////////////////////////////////

/// The sequence of decided views, as shipped to a joining replica.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ViewLog {
    #[prototk(1, message)]
    pub views: Vec<View>,
}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

/// Prepare messages rally support for a ballot on one instance.  They are answered with
/// [PrepareResponse] messages.
#[derive(Clone, Debug, Default, Message)]
pub struct PrepareRequest {
    #[prototk(1, uint64)]
    pub instance: u64,
    #[prototk(2, message)]
    pub n: Ballot,
}

/// The acceptor's answer to a [PrepareRequest].  `oldinstance` reports an instance that was
/// already decided, and carries the decided value in `v_a`.  Otherwise `accept` reports whether
/// the ballot was promised, and `(n_a, v_a)` report the highest ballot this acceptor has accepted
/// a value under, if any.
#[derive(Clone, Debug, Default, Message)]
pub struct PrepareResponse {
    #[prototk(1, Bool)]
    pub oldinstance: bool,
    #[prototk(2, Bool)]
    pub accept: bool,
    #[prototk(3, message)]
    pub n_a: Ballot,
    #[prototk(4, message)]
    pub v_a: Option<View>,
}

/// Accept messages assign a value to an instance under a previously-rallied ballot.
#[derive(Clone, Debug, Default, Message)]
pub struct AcceptRequest {
    #[prototk(1, uint64)]
    pub instance: u64,
    #[prototk(2, message)]
    pub n: Ballot,
    #[prototk(3, message)]
    pub v: View,
}

/// Whether an [AcceptRequest] was accepted.
#[derive(Clone, Debug, Default, Message)]
pub struct AcceptResponse {
    #[prototk(1, Bool)]
    pub accepted: bool,
}

/// Decide messages teach an acceptor the decided value for an instance.
#[derive(Clone, Debug, Default, Message)]
pub struct DecideRequest {
    #[prototk(1, uint64)]
    pub instance: u64,
    #[prototk(2, message)]
    pub v: View,
}

/// Acknowledgement of a [DecideRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct DecideResponse {}

// AcceptorService serves as the mutable memory of the view-change protocol.  Every configuration
// gets decided by interacting with a majority of acceptors.
service! {
    name = AcceptorService;
    server = AcceptorServer;
    client = AcceptorClient;
    error = Error;

    rpc prepare(PrepareRequest) -> PrepareResponse;
    rpc accept(AcceptRequest) -> AcceptResponse;
    rpc decide(DecideRequest) -> DecideResponse;
}

impl<T: AcceptorService + ?Sized> AcceptorService for std::sync::Arc<T> {
    fn prepare(&self, ctx: &Context, req: PrepareRequest) -> Result<PrepareResponse, Error> {
        (**self).prepare(ctx, req)
    }

    fn accept(&self, ctx: &Context, req: AcceptRequest) -> Result<AcceptResponse, Error> {
        (**self).accept(ctx, req)
    }

    fn decide(&self, ctx: &Context, req: DecideRequest) -> Result<DecideResponse, Error> {
        (**self).decide(ctx, req)
    }
}

////////////////////////////////////////////// Replica /////////////////////////////////////////////

/// The primary's replication of one client request to one backup.
#[derive(Clone, Debug, Default, Message)]
pub struct InvokeRequest {
    #[prototk(1, message)]
    pub vs: ViewStamp,
    #[prototk(2, string)]
    pub method: String,
    #[prototk(3, bytes)]
    pub body: Vec<u8>,
}

/// Acknowledgement of an [InvokeRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct InvokeResponse {}

/// A request for the primary's application state.
#[derive(Clone, Debug, Default, Message)]
pub struct TransferRequest {
    #[prototk(1, message)]
    pub src: HostID,
    #[prototk(2, message)]
    pub last: ViewStamp,
}

/// The primary's application state, or nothing if the caller was already current.
#[derive(Clone, Debug, Default, Message)]
pub struct TransferResponse {
    #[prototk(1, bytes)]
    pub state: Vec<u8>,
    #[prototk(2, message)]
    pub last: ViewStamp,
}

/// Reports that the caller finished transferring state.
#[derive(Clone, Debug, Default, Message)]
pub struct TransferDoneRequest {
    #[prototk(1, message)]
    pub src: HostID,
}

/// Acknowledgement of a [TransferDoneRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct TransferDoneResponse {}

/// A request to join the replica group.
#[derive(Clone, Debug, Default, Message)]
pub struct JoinRequest {
    #[prototk(1, message)]
    pub src: Host,
    #[prototk(2, message)]
    pub last: ViewStamp,
}

/// The decided-view log, from which the joiner reconstructs the configuration history.
#[derive(Clone, Debug, Default, Message)]
pub struct JoinResponse {
    #[prototk(1, message)]
    pub log: ViewLog,
}

/// A client request to be replicated and executed.
#[derive(Clone, Debug, Default, Message)]
pub struct ClientInvokeRequest {
    #[prototk(1, string)]
    pub method: String,
    #[prototk(2, bytes)]
    pub body: Vec<u8>,
}

/// The application's reply to a [ClientInvokeRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct ClientInvokeResponse {
    #[prototk(1, bytes)]
    pub body: Vec<u8>,
}

/// A request for the current view and primary.
#[derive(Clone, Debug, Default, Message)]
pub struct MembersRequest {}

/// The current view and primary, so a client can retarget when its primary fails.
#[derive(Clone, Debug, Default, Message)]
pub struct MembersResponse {
    #[prototk(1, message)]
    pub view: View,
    #[prototk(2, message)]
    pub primary: Option<Host>,
}

// ReplicaService is the replicated state machine's surface: replication between members, state
// transfer, joins, and the client-facing invoke.
service! {
    name = ReplicaService;
    server = ReplicaServer;
    client = ReplicaClient;
    error = Error;

    rpc invoke(InvokeRequest) -> InvokeResponse;
    rpc transfer(TransferRequest) -> TransferResponse;
    rpc transfer_done(TransferDoneRequest) -> TransferDoneResponse;
    rpc join(JoinRequest) -> JoinResponse;
    rpc client_invoke(ClientInvokeRequest) -> ClientInvokeResponse;
    rpc members(MembersRequest) -> MembersResponse;
}

impl<T: ReplicaService + ?Sized> ReplicaService for std::sync::Arc<T> {
    fn invoke(&self, ctx: &Context, req: InvokeRequest) -> Result<InvokeResponse, Error> {
        (**self).invoke(ctx, req)
    }

    fn transfer(&self, ctx: &Context, req: TransferRequest) -> Result<TransferResponse, Error> {
        (**self).transfer(ctx, req)
    }

    fn transfer_done(
        &self,
        ctx: &Context,
        req: TransferDoneRequest,
    ) -> Result<TransferDoneResponse, Error> {
        (**self).transfer_done(ctx, req)
    }

    fn join(&self, ctx: &Context, req: JoinRequest) -> Result<JoinResponse, Error> {
        (**self).join(ctx, req)
    }

    fn client_invoke(
        &self,
        ctx: &Context,
        req: ClientInvokeRequest,
    ) -> Result<ClientInvokeResponse, Error> {
        (**self).client_invoke(ctx, req)
    }

    fn members(&self, ctx: &Context, req: MembersRequest) -> Result<MembersResponse, Error> {
        (**self).members(ctx, req)
    }
}

/////////////////////////////////////////////// Locks //////////////////////////////////////////////

/// One client's claim on a lock: who, and under which acquire sequence number.
#[derive(Clone, Copy, Debug, Default, Eq, Message, PartialEq)]
pub struct Holder {
    #[prototk(1, message)]
    pub client: ClientID,
    #[prototk(2, uint32)]
    pub seqno: u32,
}

/// The outcome of an acquire.  Granted means the caller owns the lock until it releases or is
/// revoked.  Retry means the request was queued and a retry callback will nudge the caller once
/// the lock frees up.
#[derive(Clone, Copy, Debug, Default, Eq, Message, PartialEq)]
pub enum AcquireStatus {
    #[prototk(1, message)]
    #[default]
    Granted,
    #[prototk(2, message)]
    Retry,
}

/// A client's request for ownership of a lock.
#[derive(Clone, Debug, Default, Message)]
pub struct AcquireRequest {
    #[prototk(1, message)]
    pub client: ClientID,
    #[prototk(2, uint64)]
    pub lockid: u64,
    #[prototk(3, uint32)]
    pub seqno: u32,
}

/// The lock manager's answer to an [AcquireRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct AcquireResponse {
    #[prototk(1, message)]
    pub status: AcquireStatus,
}

/// A client's surrender of a lock it owns.
#[derive(Clone, Debug, Default, Message)]
pub struct ReleaseRequest {
    #[prototk(1, message)]
    pub client: ClientID,
    #[prototk(2, uint64)]
    pub lockid: u64,
    #[prototk(3, uint32)]
    pub seqno: u32,
}

/// Acknowledgement of a [ReleaseRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct ReleaseResponse {}

/// Registers the client's callback endpoint with the lock manager it targets.
#[derive(Clone, Debug, Default, Message)]
pub struct SubscribeRequest {
    #[prototk(1, message)]
    pub client: ClientID,
    #[prototk(2, message)]
    pub callback: Host,
}

/// Acknowledgement of a [SubscribeRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct SubscribeResponse {}

// LockService is the lock manager's surface.  acquire and release are replicated through the
// state machine and must reach it via client_invoke; subscribe is served directly and is not part
// of replicated state.
service! {
    name = LockService;
    server = LockServer;
    client = LockClient;
    error = Error;

    rpc acquire(AcquireRequest) -> AcquireResponse;
    rpc release(ReleaseRequest) -> ReleaseResponse;
    rpc subscribe(SubscribeRequest) -> SubscribeResponse;
}

impl<T: LockService + ?Sized> LockService for std::sync::Arc<T> {
    fn acquire(&self, ctx: &Context, req: AcquireRequest) -> Result<AcquireResponse, Error> {
        (**self).acquire(ctx, req)
    }

    fn release(&self, ctx: &Context, req: ReleaseRequest) -> Result<ReleaseResponse, Error> {
        (**self).release(ctx, req)
    }

    fn subscribe(&self, ctx: &Context, req: SubscribeRequest) -> Result<SubscribeResponse, Error> {
        (**self).subscribe(ctx, req)
    }
}

///////////////////////////////////////////// Callbacks ////////////////////////////////////////////

/// Asks the owner of a cached lock to release it back to the lock manager.
#[derive(Clone, Debug, Default, Message)]
pub struct RevokeRequest {
    #[prototk(1, uint64)]
    pub lockid: u64,
    #[prototk(2, uint32)]
    pub seqno: u32,
}

/// Acknowledgement of a [RevokeRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct RevokeResponse {}

/// Tells a waiter that the lock it wanted freed up and it should acquire again.
#[derive(Clone, Debug, Default, Message)]
pub struct RetryRequest {
    #[prototk(1, uint64)]
    pub lockid: u64,
    #[prototk(2, uint32)]
    pub seqno: u32,
}

/// Acknowledgement of a [RetryRequest].
#[derive(Clone, Debug, Default, Message)]
pub struct RetryResponse {}

// CallbackService is served by every lock client; the primary's lock manager calls it to revoke
// cached locks and to nudge waiters.
service! {
    name = CallbackService;
    server = CallbackServer;
    client = CallbackClient;
    error = Error;

    rpc revoke(RevokeRequest) -> RevokeResponse;
    rpc retry(RetryRequest) -> RetryResponse;
}

//////////////////////////////////////////// Lock table ////////////////////////////////////////////

/// The replicated status of one lock.
#[derive(Clone, Copy, Debug, Default, Eq, Message, PartialEq)]
pub enum LockState {
    /// No one owns the lock.
    #[prototk(1, message)]
    #[default]
    Free,
    /// Someone owns the lock and no one else has asked for it.
    #[prototk(2, message)]
    Held,
    /// Someone owns the lock and has been asked to give it back.
    #[prototk(3, message)]
    Revoking,
}

/// One lock's replicated record.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct LockEntry {
    #[prototk(1, uint64)]
    pub lockid: u64,
    #[prototk(2, message)]
    pub state: LockState,
    #[prototk(3, message)]
    pub owner: Option<Holder>,
    #[prototk(4, message)]
    pub waiters: Vec<Holder>,
}

/// The lock manager's snapshot, shipped whole during state transfer.  Entries are sorted by
/// lockid so that restoring a snapshot and re-snapshotting yields identical bytes.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct LockTable {
    #[prototk(1, message)]
    pub locks: Vec<LockEntry>,
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use buffertk::{stack_pack, Unpackable};

    use super::*;

    fn host(idx: u8) -> Host {
        let mut id = [0u8; 16];
        id[15] = idx;
        Host::new(HostID::new(id), format!("127.0.0.1:{}", 8000 + idx as u16))
    }

    #[test]
    fn ballots_order_lexicographically() {
        let low = Ballot {
            number: 1,
            leader: host(2).host_id(),
        };
        let mid = Ballot {
            number: 2,
            leader: host(1).host_id(),
        };
        let high = Ballot {
            number: 2,
            leader: host(2).host_id(),
        };
        assert!(Ballot::BOTTOM < low);
        assert!(low < mid);
        assert!(mid < high);
        assert!(Ballot::superseding(&high, host(1).host_id()) > high);
    }

    #[test]
    fn view_stamps_order_by_vid_then_seqno() {
        let a = ViewStamp { vid: 1, seqno: 9 };
        let b = ViewStamp { vid: 2, seqno: 1 };
        assert!(a < b);
        assert_eq!(ViewStamp { vid: 1, seqno: 10 }, a.next());
    }

    #[test]
    fn view_membership() {
        let view = View {
            vid: 3,
            members: vec![host(3), host(1), host(2)],
        };
        assert!(view.is_member(host(1).host_id()));
        assert!(!view.is_member(host(4).host_id()));
        assert_eq!(host(1).host_id(), view.smallest_member().unwrap().host_id());
        assert_eq!(2, view.quorum());
    }

    #[test]
    fn view_round_trips() {
        let view = View {
            vid: 7,
            members: vec![host(1), host(2), host(3)],
        };
        let buf = stack_pack(&view).to_vec();
        let got = View::unpack(&buf).unwrap().0;
        assert_eq!(view, got);
    }

    #[test]
    fn lock_entry_round_trips_with_and_without_owner() {
        let free = LockEntry {
            lockid: 7,
            state: LockState::Free,
            owner: None,
            waiters: vec![],
        };
        let contended = LockEntry {
            lockid: 8,
            state: LockState::Revoking,
            owner: Some(Holder {
                client: ClientID::BOTTOM.next(),
                seqno: 5,
            }),
            waiters: vec![Holder {
                client: ClientID::TOP,
                seqno: 1,
            }],
        };
        for entry in [free, contended] {
            let buf = stack_pack(&entry).to_vec();
            let got = LockEntry::unpack(&buf).unwrap().0;
            assert_eq!(entry, got);
        }
    }

    fn do_test(s: &str, exp: Error) {
        assert_eq!(s, exp.to_string());
        let buf = stack_pack(&exp).to_vec();
        let got = Error::unpack(&buf).unwrap().0;
        assert_eq!(exp, got);
    }

    #[test]
    fn not_primary() {
        do_test("NotPrimary", Error::not_primary());
    }

    #[test]
    fn busy() {
        do_test("Busy", Error::busy());
    }

    #[test]
    fn stale_view_stamp() {
        do_test(
            "StaleViewStamp { want: ViewStamp { vid: 1, seqno: 2 }, got: ViewStamp { vid: 1, seqno: 1 } }",
            Error::StaleViewStamp {
                core: ErrorCore::default(),
                want: ViewStamp { vid: 1, seqno: 2 },
                got: ViewStamp { vid: 1, seqno: 1 },
            },
        );
    }

    #[test]
    fn corruption() {
        do_test(
            "Corruption { what: \"bad checksum\" }",
            Error::corruption("bad checksum"),
        );
    }
}
