pub mod cluster {
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/tdist.cluster.v1.rs"));
    }
}

pub use prost::Message;
