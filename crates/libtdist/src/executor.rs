use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tdist_protocol::{MAX_TENSOR_ELEMENTS, NodeDef, Op, Tensor, element_count};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::container::ContainerRegistry;
use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceKey, ResourceSpec};

pub type GraphNodes = HashMap<String, NodeDef>;

/// Resources a session has resolved, keyed by fully-qualified name.
pub type ResourceCache = Mutex<HashMap<ResourceKey, Arc<Resource>>>;

/// Everything one run needs from its session and server.
pub struct ExecutionContext<'a> {
    pub graph: &'a GraphNodes,
    pub registry: &'a ContainerRegistry,
    pub resources: &'a ResourceCache,
    pub cancel: &'a CancellationToken,
    pub max_fetch_elements: Option<usize>,
}

enum Slot {
    Value(Tensor),
    Resource(Arc<Resource>),
    Empty,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Evaluate `fetches` and `targets` against the graph, returning one tensor
/// per fetch.
pub async fn execute(
    ctx: &ExecutionContext<'_>,
    feeds: BTreeMap<String, Tensor>,
    fetches: &[String],
    targets: &[String],
) -> Result<Vec<Tensor>> {
    for (name, tensor) in &feeds {
        if !ctx.graph.contains_key(name) {
            return Err(Error::NotFound(format!("fed node '{name}' is not in the graph")));
        }
        if !tensor.is_consistent() {
            return Err(Error::InvalidArgument(format!(
                "fed value for '{name}' has {} elements but shape {:?}",
                tensor.values.len(),
                tensor.shape
            )));
        }
    }

    let order = schedule(ctx.graph, &feeds, fetches.iter().chain(targets))?;

    let mut slots: HashMap<&str, Slot> = HashMap::with_capacity(order.len());
    for name in order {
        let slot = match feeds.get(name) {
            Some(fed) => Slot::Value(fed.clone()),
            None => {
                let node = ctx.graph.get(name).ok_or_else(|| missing(name))?;
                evaluate(ctx, node, &slots).await?
            }
        };
        slots.insert(name, slot);
    }

    let mut results = Vec::with_capacity(fetches.len());
    let mut fetched_elements = 0usize;
    for name in fetches {
        let tensor = match slots.get(name.as_str()) {
            Some(slot) => slot_value(name, slot).await?,
            None => return Err(missing(name)),
        };
        fetched_elements += tensor.values.len();
        if let Some(limit) = ctx.max_fetch_elements {
            if fetched_elements > limit {
                return Err(Error::ResourceExhausted(format!(
                    "fetches exceed the session limit of {limit} elements"
                )));
            }
        }
        results.push(tensor);
    }
    Ok(results)
}

/// Topological order of every node the roots depend on. Fed nodes are cut:
/// their inputs are not scheduled.
fn schedule<'g, 'r>(
    graph: &'g GraphNodes,
    feeds: &BTreeMap<String, Tensor>,
    roots: impl Iterator<Item = &'r String>,
) -> Result<Vec<&'g str>> {
    let mut marks: HashMap<&'g str, Mark> = HashMap::new();
    let mut order = Vec::new();
    for root in roots {
        let (name, _) = graph.get_key_value(root).ok_or_else(|| missing(root))?;
        visit(graph, feeds, name, &mut marks, &mut order)?;
    }
    Ok(order)
}

fn visit<'g>(
    graph: &'g GraphNodes,
    feeds: &BTreeMap<String, Tensor>,
    name: &'g str,
    marks: &mut HashMap<&'g str, Mark>,
    order: &mut Vec<&'g str>,
) -> Result<()> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            return Err(Error::InvalidArgument(format!(
                "graph has a cycle through '{name}'"
            )));
        }
        None => {}
    }
    marks.insert(name, Mark::Visiting);

    if !feeds.contains_key(name) {
        let node = graph.get(name).ok_or_else(|| missing(name))?;
        for input in node.data_inputs().chain(node.control_inputs()) {
            let (input, _) = graph.get_key_value(input).ok_or_else(|| missing(input))?;
            visit(graph, feeds, input, marks, order)?;
        }
    }

    marks.insert(name, Mark::Done);
    order.push(name);
    Ok(())
}

async fn evaluate(
    ctx: &ExecutionContext<'_>,
    node: &NodeDef,
    slots: &HashMap<&str, Slot>,
) -> Result<Slot> {
    let inputs: Vec<&str> = node.data_inputs().collect();
    if inputs.len() != node.op.arity() {
        return Err(Error::InvalidArgument(format!(
            "node '{}' expects {} inputs, has {}",
            node.name,
            node.op.arity(),
            inputs.len()
        )));
    }
    let slot_of = |i: usize| input_slot(slots, inputs[i]);

    let slot = match &node.op {
        Op::Const { value } => Slot::Value(value.clone()),
        Op::Placeholder { .. } => {
            return Err(Error::InvalidArgument(format!(
                "you must feed a value for placeholder '{}'",
                node.name
            )));
        }
        Op::Fill { shape, value } => Slot::Value(fill(&node.name, shape, *value)?),
        Op::Variable {
            container,
            shared_name,
        } => Slot::Resource(
            resolve(ctx, container, shared_name, &node.name, ResourceSpec::Variable).await?,
        ),
        Op::FifoQueue {
            capacity,
            container,
            shared_name,
        } => {
            if *capacity == 0 {
                return Err(Error::InvalidArgument(format!(
                    "queue '{}' must have a positive capacity",
                    node.name
                )));
            }
            let spec = ResourceSpec::Queue {
                capacity: *capacity,
            };
            Slot::Resource(resolve(ctx, container, shared_name, &node.name, spec).await?)
        }
        Op::Assign => {
            let variable = slot_resource(inputs[0], slot_of(0)?)?;
            let value = slot_value(inputs[1], slot_of(1)?).await?;
            variable.assign_variable(value.clone()).await?;
            Slot::Value(value)
        }
        Op::Identity => Slot::Value(slot_value(inputs[0], slot_of(0)?).await?),
        Op::Add => {
            let a = slot_value(inputs[0], slot_of(0)?).await?;
            let b = slot_value(inputs[1], slot_of(1)?).await?;
            Slot::Value(add(&node.name, &a, &b)?)
        }
        Op::Shape => {
            let value = slot_value(inputs[0], slot_of(0)?).await?;
            Slot::Value(Tensor::vector(
                value.shape.iter().map(|d| *d as f32).collect(),
            ))
        }
        Op::ReduceMin | Op::ReduceMax => {
            let value = slot_value(inputs[0], slot_of(0)?).await?;
            let mut iter = value.values.iter().copied();
            let first = iter.next().ok_or_else(|| {
                Error::InvalidArgument(format!("cannot reduce empty tensor in '{}'", node.name))
            })?;
            let reduced = if matches!(node.op, Op::ReduceMin) {
                iter.fold(first, f32::min)
            } else {
                iter.fold(first, f32::max)
            };
            Slot::Value(Tensor::scalar(reduced))
        }
        Op::NoOp => Slot::Empty,
        Op::Enqueue => {
            let queue = slot_resource(inputs[0], slot_of(0)?)?;
            let value = slot_value(inputs[1], slot_of(1)?).await?;
            queue
                .as_queue()?
                .enqueue(queue.key(), value, ctx.cancel)
                .await?;
            Slot::Empty
        }
        Op::Dequeue => {
            let queue = slot_resource(inputs[0], slot_of(0)?)?;
            let value = queue.as_queue()?.dequeue(queue.key(), ctx.cancel).await?;
            Slot::Value(value)
        }
        Op::QueueSize => {
            let queue = slot_resource(inputs[0], slot_of(0)?)?;
            let size = queue.as_queue()?.size(queue.key()).await?;
            Slot::Value(Tensor::scalar(size as f32))
        }
    };
    Ok(slot)
}

/// Resolve a resource through the session cache, creating it in the
/// registry on first use. A cached handle that has since been released means
/// the session lost its state to a reset.
async fn resolve(
    ctx: &ExecutionContext<'_>,
    container: &str,
    shared_name: &str,
    node_name: &str,
    spec: ResourceSpec,
) -> Result<Arc<Resource>> {
    let name = if shared_name.is_empty() {
        node_name
    } else {
        shared_name
    };
    let key = ResourceKey::new(ctx.registry.resolve_container(container), name);

    let mut cache = ctx.resources.lock().await;
    if let Some(cached) = cache.get(&key) {
        if cached.is_released() {
            return Err(Error::Aborted(format!(
                "resource {key} was released by a container reset"
            )));
        }
        return Ok(Arc::clone(cached));
    }
    let resource = ctx.registry.lookup_or_create(&key, spec).await?;
    cache.insert(key, Arc::clone(&resource));
    Ok(resource)
}

fn input_slot<'s>(slots: &'s HashMap<&str, Slot>, name: &str) -> Result<&'s Slot> {
    slots
        .get(name)
        .ok_or_else(|| Error::Internal(format!("input '{name}' was not evaluated")))
}

fn slot_resource(name: &str, slot: &Slot) -> Result<Arc<Resource>> {
    match slot {
        Slot::Resource(resource) => Ok(Arc::clone(resource)),
        _ => Err(Error::InvalidArgument(format!(
            "input '{name}' is not a resource handle"
        ))),
    }
}

async fn slot_value(name: &str, slot: &Slot) -> Result<Tensor> {
    match slot {
        Slot::Value(value) => Ok(value.clone()),
        Slot::Resource(resource) => match resource.as_variable() {
            Ok(_) => resource.read_variable().await,
            Err(_) => Err(Error::InvalidArgument(format!(
                "'{name}' is a {} handle and has no value",
                resource.kind_name()
            ))),
        },
        Slot::Empty => Err(Error::InvalidArgument(format!(
            "'{name}' produces no value; run it as a target instead"
        ))),
    }
}

fn add(node: &str, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let values = if a.shape == b.shape {
        a.values.iter().zip(&b.values).map(|(x, y)| x + y).collect()
    } else if let Some(s) = b.as_scalar() {
        a.values.iter().map(|x| x + s).collect()
    } else if let Some(s) = a.as_scalar() {
        return add(node, b, &Tensor::scalar(s));
    } else {
        return Err(Error::InvalidArgument(format!(
            "incompatible shapes {:?} and {:?} in '{node}'",
            a.shape, b.shape
        )));
    };
    Ok(Tensor {
        shape: a.shape.clone(),
        values,
    })
}

fn fill(node: &str, shape: &[usize], value: f32) -> Result<Tensor> {
    let count = element_count(shape).ok_or_else(|| {
        Error::InvalidArgument(format!("shape {shape:?} of '{node}' overflows"))
    })?;
    Tensor::filled(shape.to_vec(), value, MAX_TENSOR_ELEMENTS).ok_or_else(|| {
        Error::ResourceExhausted(format!(
            "'{node}' would hold {count} elements, over the limit of {MAX_TENSOR_ELEMENTS}"
        ))
    })
}

fn missing(name: &str) -> Error {
    Error::NotFound(format!("node '{name}' is not in the graph"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, op: Op, inputs: &[&str]) -> NodeDef {
        NodeDef {
            name: name.to_string(),
            op,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            device: None,
        }
    }

    fn graph(nodes: Vec<NodeDef>) -> GraphNodes {
        nodes.into_iter().map(|n| (n.name.clone(), n)).collect()
    }

    struct Fixture {
        registry: ContainerRegistry,
        resources: ResourceCache,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: ContainerRegistry::new("local"),
                resources: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }
        }

        async fn run(
            &self,
            graph: &GraphNodes,
            feeds: BTreeMap<String, Tensor>,
            fetches: &[&str],
            targets: &[&str],
        ) -> Result<Vec<Tensor>> {
            let ctx = ExecutionContext {
                graph,
                registry: &self.registry,
                resources: &self.resources,
                cancel: &self.cancel,
                max_fetch_elements: Some(1_000),
            };
            let fetches: Vec<String> = fetches.iter().map(|s| s.to_string()).collect();
            let targets: Vec<String> = targets.iter().map(|s| s.to_string()).collect();
            execute(&ctx, feeds, &fetches, &targets).await
        }
    }

    fn variable_graph() -> GraphNodes {
        graph(vec![
            node(
                "v0",
                Op::Variable {
                    container: String::new(),
                    shared_name: String::new(),
                },
                &[],
            ),
            node("v0/init", Op::Const { value: Tensor::scalar(2.0) }, &[]),
            node("v0/Assign", Op::Assign, &["v0", "v0/init"]),
            node("one", Op::Const { value: Tensor::scalar(1.0) }, &[]),
            node("sum", Op::Add, &["v0", "one"]),
        ])
    }

    #[tokio::test]
    async fn variable_requires_initialization() {
        let fx = Fixture::new();
        let g = variable_graph();
        let err = fx.run(&g, BTreeMap::new(), &["sum"], &[]).await.unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));

        fx.run(&g, BTreeMap::new(), &[], &["v0/Assign"]).await.unwrap();
        let out = fx.run(&g, BTreeMap::new(), &["sum"], &[]).await.unwrap();
        assert_eq!(out, vec![Tensor::scalar(3.0)]);
    }

    #[tokio::test]
    async fn feeds_replace_placeholders() {
        let fx = Fixture::new();
        let g = graph(vec![
            node("p", Op::Placeholder { shape: None }, &[]),
            node("min", Op::ReduceMin, &["p"]),
            node("max", Op::ReduceMax, &["p"]),
            node("shape", Op::Shape, &["p"]),
        ]);

        let err = fx.run(&g, BTreeMap::new(), &["min"], &[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let mut feeds = BTreeMap::new();
        feeds.insert(
            "p".to_string(),
            Tensor::from_parts(vec![2, 2], vec![0.5, -1.0, 3.0, 0.5]).unwrap(),
        );
        let out = fx.run(&g, feeds, &["min", "max", "shape"], &[]).await.unwrap();
        assert_eq!(out[0], Tensor::scalar(-1.0));
        assert_eq!(out[1], Tensor::scalar(3.0));
        assert_eq!(out[2], Tensor::vector(vec![2.0, 2.0]));
    }

    #[tokio::test]
    async fn unknown_fetch_is_not_found() {
        let fx = Fixture::new();
        let g = variable_graph();
        let err = fx.run(&g, BTreeMap::new(), &["nope"], &[]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn fetching_a_no_op_is_rejected() {
        let fx = Fixture::new();
        let g = graph(vec![node("noop", Op::NoOp, &[])]);
        fx.run(&g, BTreeMap::new(), &[], &["noop"]).await.unwrap();
        let err = fx.run(&g, BTreeMap::new(), &["noop"], &[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn cycles_are_rejected() {
        let fx = Fixture::new();
        let g = graph(vec![
            node("a", Op::Identity, &["b"]),
            node("b", Op::Identity, &["a"]),
        ]);
        let err = fx.run(&g, BTreeMap::new(), &["a"], &[]).await.unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn control_dependencies_run_first() {
        let fx = Fixture::new();
        let mut g = variable_graph();
        g.insert(
            "init".to_string(),
            node("init", Op::NoOp, &["^v0/Assign"]),
        );
        fx.run(&g, BTreeMap::new(), &[], &["init"]).await.unwrap();
        let out = fx.run(&g, BTreeMap::new(), &["v0"], &[]).await.unwrap();
        assert_eq!(out, vec![Tensor::scalar(2.0)]);
    }

    #[tokio::test]
    async fn fetch_limit_is_enforced() {
        let fx = Fixture::new();
        let g = graph(vec![node(
            "big",
            Op::Fill {
                shape: vec![100, 100],
                value: 0.5,
            },
            &[],
        )]);
        let err = fx.run(&g, BTreeMap::new(), &["big"], &[]).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn oversized_fill_is_rejected_before_allocating() {
        let fx = Fixture::new();
        let g = graph(vec![
            node(
                "overflow",
                Op::Fill {
                    shape: vec![usize::MAX, 2],
                    value: 0.5,
                },
                &[],
            ),
            node(
                "huge",
                Op::Fill {
                    shape: vec![MAX_TENSOR_ELEMENTS, 2],
                    value: 0.5,
                },
                &[],
            ),
        ]);
        let err = fx.run(&g, BTreeMap::new(), &[], &["overflow"]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = fx.run(&g, BTreeMap::new(), &[], &["huge"]).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn feed_with_overflowing_shape_is_rejected() {
        let fx = Fixture::new();
        let g = graph(vec![node("p", Op::Placeholder { shape: None }, &[])]);
        let mut feeds = BTreeMap::new();
        feeds.insert(
            "p".to_string(),
            Tensor {
                shape: vec![usize::MAX, 2],
                values: vec![1.0],
            },
        );
        let err = fx.run(&g, feeds, &["p"], &[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn add_broadcasts_scalars() {
        let a = Tensor::vector(vec![1.0, 2.0]);
        let s = Tensor::scalar(10.0);
        assert_eq!(add("n", &a, &s).unwrap(), Tensor::vector(vec![11.0, 12.0]));
        assert_eq!(add("n", &s, &a).unwrap(), Tensor::vector(vec![11.0, 12.0]));
        assert!(add("n", &a, &Tensor::vector(vec![1.0, 2.0, 3.0])).is_err());
    }

    #[tokio::test]
    async fn queue_roundtrip_through_graph() {
        let fx = Fixture::new();
        let g = graph(vec![
            node(
                "q",
                Op::FifoQueue {
                    capacity: 10,
                    container: String::new(),
                    shared_name: String::new(),
                },
                &[],
            ),
            node("x", Op::Const { value: Tensor::scalar(37.0) }, &[]),
            node("enq", Op::Enqueue, &["q", "x"]),
            node("deq", Op::Dequeue, &["q"]),
            node("size", Op::QueueSize, &["q"]),
        ]);
        fx.run(&g, BTreeMap::new(), &[], &["enq"]).await.unwrap();
        assert_eq!(
            fx.run(&g, BTreeMap::new(), &["size"], &[]).await.unwrap(),
            vec![Tensor::scalar(1.0)]
        );
        assert_eq!(
            fx.run(&g, BTreeMap::new(), &["deq"], &[]).await.unwrap(),
            vec![Tensor::scalar(37.0)]
        );
    }
}
