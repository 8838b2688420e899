//! Human-readable rendering of cluster records. Jobs keep record order and
//! tasks are listed by ascending index.

use std::fmt::Display;

use tdist_proto::cluster::v1::{ClusterDef, ServerDef};

pub fn cluster_def(def: &ClusterDef) -> String {
    let mut w = Writer::default();
    w.jobs(def);
    w.out
}

pub fn server_def(def: &ServerDef) -> String {
    let mut w = Writer::default();
    w.open("cluster");
    if let Some(cluster) = &def.cluster {
        w.jobs(cluster);
    }
    w.close();
    w.string("job_name", &def.job_name);
    w.scalar("task_index", def.task_index);
    w.string("protocol", &def.protocol);
    if let Some(config) = &def.default_session_config {
        if config.operation_timeout_in_ms.is_some() || config.max_fetch_elements.is_some() {
            w.open("default_session_config");
            if let Some(ms) = config.operation_timeout_in_ms {
                w.scalar("operation_timeout_in_ms", ms);
            }
            if let Some(max) = config.max_fetch_elements {
                w.scalar("max_fetch_elements", max);
            }
            w.close();
        }
    }
    w.out
}

#[derive(Default)]
struct Writer {
    out: String,
    depth: usize,
}

impl Writer {
    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    fn open(&mut self, name: &str) {
        self.indent();
        self.out.push_str(name);
        self.out.push_str(" {\n");
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.indent();
        self.out.push_str("}\n");
    }

    fn string(&mut self, name: &str, value: &str) {
        self.indent();
        self.out.push_str(&format!("{name}: {}\n", quote(value)));
    }

    fn scalar(&mut self, name: &str, value: impl Display) {
        self.indent();
        self.out.push_str(&format!("{name}: {value}\n"));
    }

    fn jobs(&mut self, def: &ClusterDef) {
        for job in &def.job {
            self.open("job");
            self.string("name", &job.name);
            let mut tasks: Vec<_> = job.tasks.iter().collect();
            tasks.sort_by_key(|(index, _)| **index);
            for (index, address) in tasks {
                self.indent();
                self.out.push_str(&format!(
                    "tasks {{ key: {index} value: {} }}\n",
                    quote(address)
                ));
            }
            self.close();
        }
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
