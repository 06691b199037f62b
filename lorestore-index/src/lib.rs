// Copyright 2025 Lorestore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Lorestore Index Layer
//!
//! The in-memory graph index rebuilt from the log, and the read-only
//! analytics that run over it.
//!
//! ## Graph Index
//!
//! [`GraphIndex`] holds entities by id and relationships by
//! `(source, target, type)` with adjacency in both directions. It is built
//! from the log on open and updated incrementally after every append.
//!
//! ## Analytics
//!
//! - **Paths** (`paths`): BFS and Dijkstra (`1/weight` cost)
//! - **Centrality** (`centrality`): degree, closeness and Brandes betweenness
//!   under a [`Budget`]
//! - **Communities** (`leiden`): seeded Leiden clustering
//! - **Similarity** (`similarity`): weighted project feature matching
//! - **Anomalies** (`anomaly`): z-score and rare-category detection
//!
//! Every analytic is deterministic for a fixed graph state.

pub mod anomaly;
pub mod budget;
pub mod centrality;
pub mod graph;
pub mod leiden;
pub mod paths;
pub mod similarity;

pub use anomaly::{detect_anomalies, Anomaly, AnomalyOptions};
pub use budget::{Bounded, Budget};
pub use centrality::{centrality, degree_ranking, CentralityReport};
pub use graph::{BuildReport, Degree, Direction, GraphIndex, Neighbor};
pub use leiden::{Cluster, ClusteringResult, LeidenClustering, LeidenConfig};
pub use paths::{path_exists, shortest_path, weighted_path, Path, PathOptions};
pub use similarity::{find_similar, project_similarity, SimilarEntity, SimilarityConfig};
