//! Key layout shared by every process coordinating through the same store.

pub(crate) fn lock_key(name: &str) -> String {
    format!("lock:{name}")
}

pub(crate) fn owner_key(semname: &str) -> String {
    format!("{semname}:owner")
}

pub(crate) fn counter_key(semname: &str) -> String {
    format!("{semname}:counter")
}

pub(crate) fn members_key(guild: &str) -> String {
    format!("members:{guild}")
}

pub(crate) const DELAYED_KEY: &str = "delayed:";

pub(crate) fn ready_queue_key(queue: &str) -> String {
    format!("queue:{queue}")
}

pub(crate) fn config_key(kind: &str, component: &str) -> String {
    format!("config:{kind}:{component}")
}

pub(crate) fn index_key(name: &str) -> String {
    format!("idx:{name}")
}
