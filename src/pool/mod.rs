pub(crate) mod block_pool;
pub(crate) mod bucket;
pub(crate) mod free_list;
pub(crate) mod integration;
pub(crate) mod mapped;
pub(crate) mod object_pool;
pub(crate) mod os;
pub(crate) mod page_pool;
pub(crate) mod stats;
pub(crate) mod tagged;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
