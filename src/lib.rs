//! Turns table descriptions into a property graph of tables and columns and
//! keeps a lookup index from `(table, column)` back to the text each table
//! came from.
//!
//! A line such as `orders,Customer order table` is resolved against the
//! column file `table_schema/columns/orders.csv`, written to the graph as one
//! table vertex, one vertex per column and one containment edge per column,
//! then registered in a [`kg_index::KgIndex`].

pub mod api;
pub mod auth;
pub mod config;
pub mod embedding;
pub mod error;
pub mod field_mapping;
pub mod graph_store;
pub mod index_builder;
pub mod kg_index;
pub mod models;
pub mod queue;
pub mod schema_store;
pub mod service;
pub mod sqlite_graph;
pub mod statement;
pub mod table_resolver;
pub mod upsert;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{mpsc, RwLock};

use crate::{config::Config, models::JobRecord, service::IndexService};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
    pub queue_tx: mpsc::Sender<String>,
    /// Locked by the queue worker for the whole of one ingestion.
    pub service: Arc<Mutex<IndexService>>,
}
