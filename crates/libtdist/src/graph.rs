use std::collections::HashSet;

use tdist_protocol::{NodeDef, Op, Tensor};
use uuid::Uuid;

/// A named node output that can be fetched, fed or run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Output(String);

impl Output {
    pub fn name(&self) -> &str {
        &self.0
    }

    fn control(&self) -> String {
        format!("^{}", self.0)
    }
}

impl AsRef<str> for Output {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A variable node together with the `Assign` that initializes it.
#[derive(Debug, Clone)]
pub struct Variable {
    pub value: Output,
    pub initializer: Output,
}

#[derive(Debug, Clone)]
pub struct Queue {
    pub handle: Output,
}

/// Format a device string for a task.
pub fn device(job_name: &str, task_index: u32) -> String {
    format!("/job:{job_name}/task:{task_index}")
}

/// Append-only graph builder. Sessions upload only the nodes they have not
/// seen yet, tracked by the graph id and node count.
#[derive(Debug)]
pub struct Graph {
    id: Uuid,
    nodes: Vec<NodeDef>,
    names: HashSet<String>,
    device: Option<String>,
    initializers: Vec<Output>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            nodes: Vec::new(),
            names: HashSet::new(),
            device: None,
            initializers: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn nodes(&self) -> &[NodeDef] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Existing node by name.
    pub fn output(&self, name: &str) -> Option<Output> {
        self.names.contains(name).then(|| Output(name.to_string()))
    }

    /// Placement applied to nodes added from now on; `None` clears it.
    pub fn set_device(&mut self, device: Option<String>) {
        self.device = device;
    }

    fn unique_name(&self, base: &str) -> String {
        if !self.names.contains(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|candidate| !self.names.contains(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    fn add_node(&mut self, base: &str, op: Op, inputs: Vec<String>) -> Output {
        let name = self.unique_name(base);
        self.names.insert(name.clone());
        self.nodes.push(NodeDef {
            name: name.clone(),
            op,
            inputs,
            device: self.device.clone(),
        });
        Output(name)
    }

    pub fn constant(&mut self, name: &str, value: impl Into<Tensor>) -> Output {
        self.add_node(name, Op::Const { value: value.into() }, Vec::new())
    }

    pub fn placeholder(&mut self, name: &str, shape: Option<Vec<usize>>) -> Output {
        self.add_node(name, Op::Placeholder { shape }, Vec::new())
    }

    pub fn fill(&mut self, name: &str, shape: Vec<usize>, value: f32) -> Output {
        self.add_node(name, Op::Fill { shape, value }, Vec::new())
    }

    /// Variable in the server's default container.
    pub fn variable(&mut self, name: &str, initial: impl Into<Tensor>) -> Variable {
        self.variable_in("", name, initial)
    }

    pub fn variable_in(
        &mut self,
        container: &str,
        name: &str,
        initial: impl Into<Tensor>,
    ) -> Variable {
        let value = self.add_node(
            name,
            Op::Variable {
                container: container.to_string(),
                shared_name: String::new(),
            },
            Vec::new(),
        );
        let init_value = self.constant(&format!("{}/initial_value", value.name()), initial);
        let initializer = self.assign(&value, &init_value);
        self.initializers.push(initializer.clone());
        Variable { value, initializer }
    }

    pub fn assign(&mut self, variable: &Output, value: &Output) -> Output {
        self.add_node(
            &format!("{}/Assign", variable.name()),
            Op::Assign,
            vec![variable.0.clone(), value.0.clone()],
        )
    }

    pub fn identity(&mut self, name: &str, input: &Output) -> Output {
        self.add_node(name, Op::Identity, vec![input.0.clone()])
    }

    pub fn add(&mut self, name: &str, a: &Output, b: &Output) -> Output {
        self.add_node(name, Op::Add, vec![a.0.clone(), b.0.clone()])
    }

    pub fn shape(&mut self, name: &str, input: &Output) -> Output {
        self.add_node(name, Op::Shape, vec![input.0.clone()])
    }

    pub fn reduce_min(&mut self, name: &str, input: &Output) -> Output {
        self.add_node(name, Op::ReduceMin, vec![input.0.clone()])
    }

    pub fn reduce_max(&mut self, name: &str, input: &Output) -> Output {
        self.add_node(name, Op::ReduceMax, vec![input.0.clone()])
    }

    /// Node with no output that runs `deps` first.
    pub fn no_op(&mut self, name: &str, deps: &[&Output]) -> Output {
        let inputs = deps.iter().map(|d| d.control()).collect();
        self.add_node(name, Op::NoOp, inputs)
    }

    /// Runs every variable initializer added so far.
    pub fn global_variables_initializer(&mut self) -> Output {
        let deps: Vec<String> = self.initializers.iter().map(Output::control).collect();
        self.add_node("init", Op::NoOp, deps)
    }

    /// Queue in the server's default container.
    pub fn fifo_queue(&mut self, name: &str, capacity: usize) -> Queue {
        self.fifo_queue_in("", name, capacity)
    }

    pub fn fifo_queue_in(&mut self, container: &str, name: &str, capacity: usize) -> Queue {
        let handle = self.add_node(
            name,
            Op::FifoQueue {
                capacity,
                container: container.to_string(),
                shared_name: String::new(),
            },
            Vec::new(),
        );
        Queue { handle }
    }

    pub fn enqueue(&mut self, queue: &Queue, value: &Output) -> Output {
        self.add_node(
            &format!("{}_enqueue", queue.handle.name()),
            Op::Enqueue,
            vec![queue.handle.0.clone(), value.0.clone()],
        )
    }

    pub fn dequeue(&mut self, queue: &Queue) -> Output {
        self.add_node(
            &format!("{}_dequeue", queue.handle.name()),
            Op::Dequeue,
            vec![queue.handle.0.clone()],
        )
    }

    pub fn queue_size(&mut self, queue: &Queue) -> Output {
        self.add_node(
            &format!("{}_size", queue.handle.name()),
            Op::QueueSize,
            vec![queue.handle.0.clone()],
        )
    }
}
