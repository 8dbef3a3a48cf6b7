//! Wire messages for the participant gRPC services used by the bridge.
//!
//! Hand-maintained `prost` definitions (package `ledgerapi.v1`) so the build
//! does not need `protoc`. Only the surface the bridge drives is mirrored:
//! command submission, ledger-end/active-contract state, the update stream,
//! external party allocation, and interactive submission.

/// Template identity: `(package, module, entity)`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Identifier {
    #[prost(string, tag = "1")]
    pub package_id: String,
    #[prost(string, tag = "2")]
    pub module_name: String,
    #[prost(string, tag = "3")]
    pub entity_name: String,
}

impl Identifier {
    /// Compare ignoring package id, for filters keyed on module/entity.
    pub fn same_entity(&self, other: &Identifier) -> bool {
        self.module_name == other.module_name && self.entity_name == other.entity_name
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    #[prost(message, repeated, tag = "1")]
    pub fields: Vec<RecordField>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordField {
    #[prost(string, tag = "1")]
    pub label: String,
    #[prost(message, optional, tag = "2")]
    pub value: Option<Value>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Value {
    #[prost(oneof = "value::Sum", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub sum: Option<value::Sum>,
}

pub mod value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Sum {
        #[prost(string, tag = "1")]
        Text(String),
        /// Decimal rendered with 18 fractional digits.
        #[prost(string, tag = "2")]
        Numeric(String),
        #[prost(string, tag = "3")]
        Party(String),
        #[prost(string, tag = "4")]
        ContractId(String),
        #[prost(bool, tag = "5")]
        Bool(bool),
        #[prost(int64, tag = "6")]
        Int64(i64),
        #[prost(message, tag = "7")]
        Record(super::Record),
        #[prost(message, tag = "8")]
        List(super::ValueList),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueList {
    #[prost(message, repeated, tag = "1")]
    pub elements: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Commands {
    #[prost(string, tag = "1")]
    pub application_id: String,
    /// Participant-side deduplication key.
    #[prost(string, tag = "2")]
    pub command_id: String,
    #[prost(string, repeated, tag = "3")]
    pub act_as: Vec<String>,
    #[prost(string, tag = "4")]
    pub synchronizer_id: String,
    #[prost(uint64, tag = "5")]
    pub deduplication_seconds: u64,
    #[prost(message, repeated, tag = "6")]
    pub commands: Vec<Command>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(oneof = "command::Command", tags = "1, 2")]
    pub command: Option<command::Command>,
}

pub mod command {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Command {
        #[prost(message, tag = "1")]
        Create(super::CreateCommand),
        #[prost(message, tag = "2")]
        Exercise(super::ExerciseCommand),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateCommand {
    #[prost(message, optional, tag = "1")]
    pub template_id: Option<Identifier>,
    #[prost(message, optional, tag = "2")]
    pub create_arguments: Option<Record>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExerciseCommand {
    #[prost(message, optional, tag = "1")]
    pub template_id: Option<Identifier>,
    #[prost(string, tag = "2")]
    pub contract_id: String,
    #[prost(string, tag = "3")]
    pub choice: String,
    #[prost(message, optional, tag = "4")]
    pub choice_argument: Option<Value>,
}

// ---------------------------------------------------------------------------
// Events and transactions
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatedEvent {
    #[prost(string, tag = "1")]
    pub contract_id: String,
    #[prost(message, optional, tag = "2")]
    pub template_id: Option<Identifier>,
    #[prost(message, optional, tag = "3")]
    pub create_arguments: Option<Record>,
    #[prost(uint64, tag = "4")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ArchivedEvent {
    #[prost(string, tag = "1")]
    pub contract_id: String,
    #[prost(message, optional, tag = "2")]
    pub template_id: Option<Identifier>,
    #[prost(uint64, tag = "3")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExercisedEvent {
    #[prost(string, tag = "1")]
    pub contract_id: String,
    #[prost(message, optional, tag = "2")]
    pub template_id: Option<Identifier>,
    #[prost(string, tag = "3")]
    pub choice: String,
    #[prost(message, optional, tag = "4")]
    pub choice_argument: Option<Value>,
    #[prost(message, optional, tag = "5")]
    pub exercise_result: Option<Value>,
    #[prost(bool, tag = "6")]
    pub consuming: bool,
    #[prost(uint64, tag = "7")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(oneof = "event::Event", tags = "1, 2, 3")]
    pub event: Option<event::Event>,
}

pub mod event {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        Created(super::CreatedEvent),
        #[prost(message, tag = "2")]
        Archived(super::ArchivedEvent),
        #[prost(message, tag = "3")]
        Exercised(super::ExercisedEvent),
    }
}

/// One committed update. Events are delivered in declared order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Transaction {
    #[prost(string, tag = "1")]
    pub update_id: String,
    #[prost(string, tag = "2")]
    pub command_id: String,
    #[prost(int64, tag = "3")]
    pub offset: i64,
    #[prost(message, repeated, tag = "4")]
    pub events: Vec<Event>,
}

impl Transaction {
    /// Created events of the given template, in declared order.
    pub fn created<'a>(
        &'a self,
        template: &'a Identifier,
    ) -> impl Iterator<Item = &'a CreatedEvent> + 'a {
        self.events.iter().filter_map(move |e| match &e.event {
            Some(event::Event::Created(c))
                if c.template_id.as_ref().is_some_and(|t| t.same_entity(template)) =>
            {
                Some(c)
            }
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Command service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitAndWaitRequest {
    #[prost(message, optional, tag = "1")]
    pub commands: Option<Commands>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitAndWaitResponse {
    #[prost(message, optional, tag = "1")]
    pub transaction: Option<Transaction>,
}

// ---------------------------------------------------------------------------
// State service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLedgerEndRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLedgerEndResponse {
    #[prost(int64, tag = "1")]
    pub offset: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetActiveContractsRequest {
    #[prost(string, tag = "1")]
    pub party: String,
    #[prost(message, repeated, tag = "2")]
    pub template_ids: Vec<Identifier>,
    #[prost(int64, tag = "3")]
    pub active_at_offset: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetActiveContractsResponse {
    #[prost(message, optional, tag = "1")]
    pub created_event: Option<CreatedEvent>,
}

// ---------------------------------------------------------------------------
// Update service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUpdatesRequest {
    #[prost(int64, tag = "1")]
    pub begin_exclusive: i64,
    /// Absent ⇒ tail the stream until it is dropped.
    #[prost(int64, optional, tag = "2")]
    pub end_inclusive: Option<i64>,
    #[prost(string, tag = "3")]
    pub party: String,
    #[prost(message, repeated, tag = "4")]
    pub template_ids: Vec<Identifier>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUpdatesResponse {
    #[prost(message, optional, tag = "1")]
    pub transaction: Option<Transaction>,
}

// ---------------------------------------------------------------------------
// Party management
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocateExternalPartyRequest {
    #[prost(string, tag = "1")]
    pub party_id_hint: String,
    /// SubjectPublicKeyInfo DER of the party's signing key.
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    /// Signature over `sha256(party_id_hint ‖ public_key)` by that key.
    #[prost(bytes = "vec", tag = "3")]
    pub onboarding_signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocateExternalPartyResponse {
    #[prost(string, tag = "1")]
    pub party_id: String,
}

// ---------------------------------------------------------------------------
// Interactive submission
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrepareSubmissionRequest {
    #[prost(message, optional, tag = "1")]
    pub commands: Option<Commands>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrepareSubmissionResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub prepared_transaction: Vec<u8>,
    /// sha256 of `prepared_transaction`; the external party signs this.
    #[prost(bytes = "vec", tag = "2")]
    pub prepared_transaction_hash: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartySignature {
    #[prost(string, tag = "1")]
    pub signed_by_fingerprint: String,
    /// 64-byte `r ‖ s`.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(int32, tag = "3")]
    pub format: i32,
    #[prost(int32, tag = "4")]
    pub scheme: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteSubmissionRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub prepared_transaction: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub signature: Option<PartySignature>,
    #[prost(string, tag = "3")]
    pub submission_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteSubmissionResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn value_encodes_and_decodes() {
        let value = Value {
            sum: Some(value::Sum::Record(Record {
                fields: vec![
                    RecordField {
                        label: "owner".into(),
                        value: Some(Value {
                            sum: Some(value::Sum::Party("user_ab12::1220ff".into())),
                        }),
                    },
                    RecordField {
                        label: "amount".into(),
                        value: Some(Value {
                            sum: Some(value::Sum::Numeric("50.000000000000000000".into())),
                        }),
                    },
                ],
            })),
        };
        let bytes = value.encode_to_vec();
        assert_eq!(Value::decode(bytes.as_slice()).unwrap(), value);
    }

    #[test]
    fn transaction_created_filters_by_entity() {
        let holding = Identifier {
            package_id: "pkg1".into(),
            module_name: "CIP56.Token".into(),
            entity_name: "Holding".into(),
        };
        let other = Identifier {
            package_id: "pkg1".into(),
            module_name: "Bridge.Custody".into(),
            entity_name: "WithdrawalRequest".into(),
        };
        let tx = Transaction {
            update_id: "u1".into(),
            command_id: "c1".into(),
            offset: 9,
            events: vec![
                Event {
                    event: Some(event::Event::Created(CreatedEvent {
                        contract_id: "cid-1".into(),
                        template_id: Some(holding.clone()),
                        create_arguments: None,
                        node_id: 0,
                    })),
                },
                Event {
                    event: Some(event::Event::Created(CreatedEvent {
                        contract_id: "cid-2".into(),
                        template_id: Some(other),
                        create_arguments: None,
                        node_id: 1,
                    })),
                },
            ],
        };
        let found: Vec<_> = tx.created(&holding).map(|c| c.contract_id.clone()).collect();
        assert_eq!(found, vec!["cid-1"]);
    }
}
