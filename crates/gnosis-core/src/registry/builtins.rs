//! Built-in graph transformations.
//!
//! - `graph.upsert_node`: create a node, or write a new version of an existing one.
//! - `graph.link`: create an edge between two existing entities.
//! - `graph.retire`: tombstone a node (with its edges) or a single edge.
//!
//! All require `graph.write`. Every write also passes the self-model guard
//! in [`crate::selfmap::check_plugin_write`], so reserved nodes and
//! `observes`/`summarizes` edges stay out of reach.

use super::{
    Capability, HandlerContext, HandlerError, HandlerOutput, PluginInfo, Registrant,
    TransformationRegistry,
};
use crate::selfmap::{check_external_write, check_plugin_write};
use crate::types::{
    EdgeData, EntityId, EntityKind, EntityWrite, GnosisError, NodeLabel, Payload, Polarity,
    Provenance,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeSet;

pub const UPSERT_NODE: &str = "graph.upsert_node";
pub const LINK: &str = "graph.link";
pub const RETIRE: &str = "graph.retire";

#[derive(Debug, Deserialize)]
struct UpsertArgs {
    id: Option<EntityId>,
    #[serde(default = "default_label")]
    label: NodeLabel,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    tags: BTreeSet<String>,
    confidence: Option<f64>,
}

fn default_label() -> NodeLabel {
    NodeLabel::Generic
}

#[derive(Debug, Deserialize)]
struct LinkArgs {
    from: EntityId,
    to: EntityId,
    relation: String,
    #[serde(default)]
    polarity: Polarity,
    #[serde(default = "default_weight")]
    weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct RetireArgs {
    id: EntityId,
}

fn parse<'de, T: Deserialize<'de>>(args: &'de Value) -> Result<T, HandlerError> {
    T::deserialize(args).map_err(|e| HandlerError::new(format!("bad arguments: {}", e)))
}

fn upsert_node(args: &Value, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
    let args: UpsertArgs = parse(args)?;
    let mut provenance = Provenance::new(ctx.entities.now());
    if let Some(confidence) = args.confidence {
        provenance = provenance.with_confidence(confidence);
    }
    let payload = Payload::node(args.label, args.content).with_tags(args.tags);

    let current = args.id.and_then(|id| ctx.entities.get(id, None).ok());
    let (write, created) = match (args.id, &current) {
        (Some(id), Some(_)) => (EntityWrite::update_latest(id, payload, provenance), false),
        (Some(id), None) => {
            let mut write = EntityWrite::create(payload, provenance);
            write.id = id;
            (write, true)
        }
        (None, _) => (EntityWrite::create(payload, provenance), true),
    };
    check_plugin_write(current.as_deref(), &write)?;

    let reply = json!({ "id": write.id.to_string(), "created": created });
    Ok(HandlerOutput::reply(reply).with_write(write))
}

fn link(args: &Value, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
    let args: LinkArgs = parse(args)?;
    for endpoint in [args.from, args.to] {
        if !ctx.entities.contains(endpoint) {
            return Err(GnosisError::NotFound {
                id: endpoint,
                version: None,
            }
            .into());
        }
    }

    let write = EntityWrite::create(
        Payload::Edge(EdgeData {
            from: args.from,
            to: args.to,
            relation: args.relation,
            polarity: args.polarity,
            weight: args.weight,
        }),
        Provenance::new(ctx.entities.now()),
    );
    check_external_write(None, &write)?;
    let reply = json!({ "id": write.id.to_string() });
    Ok(HandlerOutput::reply(reply).with_write(write))
}

fn retire(args: &Value, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
    let RetireArgs { id } = parse(args)?;
    let current = ctx.entities.get(id, None)?;
    let now = ctx.entities.now();

    let mut writes = Vec::new();
    if current.as_node().is_some() {
        for edge in ctx.entities.incident_edges(id) {
            writes.push(EntityWrite::retire(edge, EntityKind::Edge, Provenance::new(now)));
        }
    }
    let kind = current.payload.kind();
    writes.push(EntityWrite::retire(id, kind, Provenance::new(now)));

    for write in &writes {
        let before = ctx.entities.get(write.id, None)?;
        check_plugin_write(Some(&before), write)?;
    }

    let reply = json!({ "id": id.to_string(), "retired": writes.len() });
    Ok(writes
        .into_iter()
        .fold(HandlerOutput::reply(reply), HandlerOutput::with_write))
}

/// Register the built-in operations as the core itself.
pub fn register_builtins(registry: &TransformationRegistry) -> Result<(), GnosisError> {
    let core = Registrant::new("gnosis", [Capability::GRAPH_WRITE]);
    let version = env!("CARGO_PKG_VERSION");
    for (operation, handler) in [
        (UPSERT_NODE, upsert_node as fn(&Value, &HandlerContext) -> _),
        (LINK, link),
        (RETIRE, retire),
    ] {
        let info = PluginInfo::new(operation, version, "gnosis")
            .with_permissions([Capability::GRAPH_WRITE]);
        registry.register(operation, handler, info, &core)?;
    }
    Ok(())
}
