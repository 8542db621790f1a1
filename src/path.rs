use crate::color::{Colormap, Rgb};
use crate::dataset::{Dataset, SparseMatrix};
use crate::error::{EvoError, Result};
use crate::figure::{Figure, OutputConfig, Shape};
use log::{debug, info};
use petgraph::algo::dijkstra;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Reversed;

const MISSING_GRAPH: &str = "transition graph (run the velocity graph step first)";

/// How the signed transition matrix is turned into a graph
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Treat every transition as a two-way edge
    pub undirected: bool,
}

/// Fail unless every observation has at least one positive neighbor distance.
pub fn check_neighbors(dataset: &Dataset) -> Result<()> {
    let distances = dataset.distances();
    for row in 0..distances.n_rows() {
        if distances.positive_in_row(row) == 0 {
            return Err(EvoError::CorruptedNeighbors { row });
        }
    }
    Ok(())
}

/// Unweighted graph over observations: one edge per nonzero cell of `signed`.
/// Node `i` is observation `i`; the edge weight keeps the signed value.
fn transition_graph(signed: &SparseMatrix, undirected: bool) -> DiGraph<usize, f64> {
    let mut graph = DiGraph::with_capacity(signed.n_rows(), 0);
    for i in 0..signed.n_rows() {
        graph.add_node(i);
    }
    for row in 0..signed.n_rows() {
        for (col, value) in signed.row_nonzero(row) {
            graph.add_edge(NodeIndex::new(row), NodeIndex::new(col), value);
            if undirected && row != col {
                graph.add_edge(NodeIndex::new(col), NodeIndex::new(row), value);
            }
        }
    }
    graph
}

/// Hop-count shortest path from `source` to `target` through the transition
/// graph `{vkey}_graph - {vkey}_graph_neg`.
///
/// Among several shortest paths the lexicographically smallest node sequence
/// is returned, so results do not depend on edge storage order.
pub fn shortest_path(
    dataset: &Dataset,
    source: usize,
    target: usize,
    vkey: &str,
    opts: ResolveOptions,
) -> Result<Vec<usize>> {
    check_neighbors(dataset)?;

    let pos_key = format!("{}_graph", vkey);
    let neg_key = format!("{}_graph_neg", vkey);
    let pos = dataset
        .graph(&pos_key)
        .ok_or_else(|| EvoError::missing(MISSING_GRAPH, &pos_key))?;
    let neg = dataset
        .graph(&neg_key)
        .ok_or_else(|| EvoError::missing(MISSING_GRAPH, &neg_key))?;

    let n = dataset.n_obs();
    for idx in [source, target] {
        if idx >= n {
            return Err(EvoError::IndexOutOfRange {
                what: "observation",
                index: idx,
                len: n,
            });
        }
    }

    let signed = pos.subtract(neg)?;
    let graph = transition_graph(&signed, opts.undirected);
    debug!(
        "Transition graph: {} nodes, {} edges",
        graph.node_count(),
        graph.edge_count()
    );

    // Hop distance from every node to the target
    let to_target = dijkstra(Reversed(&graph), NodeIndex::new(target), None, |_| 1usize);

    let mut current = NodeIndex::new(source);
    let mut remaining = *to_target.get(&current).ok_or(EvoError::NoPath {
        source_idx: source,
        target_idx: target,
    })?;
    let mut path = vec![source];
    while remaining > 0 {
        let next = graph
            .neighbors(current)
            .filter(|n| to_target.get(n) == Some(&(remaining - 1)))
            .min_by_key(|n| n.index())
            .ok_or(EvoError::NoPath {
                source_idx: source,
                target_idx: target,
            })?;
        path.push(next.index());
        current = next;
        remaining -= 1;
    }

    info!("Shortest path {} -> {}: {} steps", source, target, path.len() - 1);
    Ok(path)
}

/// Marker and line styling for a drawn path
#[derive(Debug, Clone)]
pub struct PathStyle {
    /// Marker area in points squared
    pub size: f64,
    pub color: Rgb,
    /// When set, markers are colored by their progress along the path
    pub cmap: Option<Colormap>,
    pub edge_color: Rgb,
    pub line_color: Rgb,
    /// Line width in pixels
    pub line_width: f64,
}

impl Default for PathStyle {
    fn default() -> Self {
        PathStyle {
            size: 15.0,
            color: (255, 255, 255),
            cmap: None,
            edge_color: (0, 0, 0),
            line_color: (0x88, 0x88, 0x88),
            line_width: 1.0,
        }
    }
}

/// What to draw: an explicit path, or endpoints to resolve one between
#[derive(Debug, Clone)]
pub struct PathRequest {
    pub path: Option<Vec<usize>>,
    pub source: Option<usize>,
    pub target: Option<usize>,
    pub basis: String,
    pub vkey: String,
    pub resolve: ResolveOptions,
    pub style: PathStyle,
}

impl Default for PathRequest {
    fn default() -> Self {
        PathRequest {
            path: None,
            source: None,
            target: None,
            basis: "umap".to_string(),
            vkey: "velocity".to_string(),
            resolve: ResolveOptions::default(),
            style: PathStyle::default(),
        }
    }
}

impl PathRequest {
    /// The explicit path, or the shortest one between the endpoints.
    pub fn nodes(&self, dataset: &Dataset) -> Result<Vec<usize>> {
        match (&self.path, self.source, self.target) {
            (Some(path), _, _) => Ok(path.clone()),
            (None, Some(source), Some(target)) => {
                shortest_path(dataset, source, target, &self.vkey, self.resolve)
            }
            _ => Err(EvoError::MissingArgument(
                "Must provide path indices or source and target indices.",
            )),
        }
    }
}

/// Draw a path on the `X_{basis}` embedding: one line segment per step,
/// then a marker per node on top. Draws on `figure` if given, otherwise on
/// a new figure fitted to the path.
pub fn draw_path(
    dataset: &Dataset,
    request: &PathRequest,
    figure: Option<Figure>,
    output: &OutputConfig,
) -> Result<Figure> {
    let path = request.nodes(dataset)?;

    let coords = dataset
        .embedding(&request.basis)
        .ok_or_else(|| EvoError::missing("embedding", format!("X_{}", request.basis)))?;

    let mut points = Vec::with_capacity(path.len());
    for &idx in &path {
        let p = coords.get(idx).ok_or(EvoError::IndexOutOfRange {
            what: "path node",
            index: idx,
            len: coords.len(),
        })?;
        points.push(*p);
    }

    let mut figure = figure.unwrap_or_else(|| output.new_figure());
    figure.include(&points);

    let style = &request.style;
    for step in points.windows(2) {
        figure.push(Shape::Segment {
            from: step[0],
            to: step[1],
            width: style.line_width,
            color: style.line_color,
            zorder: 5,
        });
    }

    let last = points.len().saturating_sub(1).max(1) as f64;
    for (i, &at) in points.iter().enumerate() {
        let fill = match &style.cmap {
            Some(cmap) => cmap.sample(i as f64 / last),
            None => style.color,
        };
        figure.push(Shape::Marker {
            at,
            size: style.size,
            fill,
            edge: Some(style.edge_color),
            zorder: 10,
        });
    }

    debug!("Drew path of {} nodes on `X_{}`", points.len(), request.basis);
    Ok(figure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::parse_annotations;
    use rustc_hash::FxHashSet;

    /// Dataset with `n` observations on a line, a full neighbor graph and
    /// the given signed transitions.
    fn dataset_with_edges(n: usize, edges: &[(usize, usize, f64)]) -> Dataset {
        let mut text = String::new();
        for i in 0..n {
            text.push_str(&format!("O\ts{}\tA\tA\n", i));
            text.push_str(&format!("E\tumap\t{}\t{}\t{}\n", i, i, i * i));
            text.push_str(&format!("D\t{}\t{}\t1.0\n", i, (i + 1) % n));
        }
        text.push_str("G\tvelocity_graph_neg\t0\t0\t0\n");
        for &(a, b, w) in edges {
            if w >= 0.0 {
                text.push_str(&format!("G\tvelocity_graph\t{}\t{}\t{}\n", a, b, w));
            } else {
                text.push_str(&format!("G\tvelocity_graph_neg\t{}\t{}\t{}\n", a, b, -w));
            }
        }
        parse_annotations(&text).unwrap()
    }

    /// Every simple path from source to target, by exhaustive search
    fn all_paths(
        n: usize,
        edges: &[(usize, usize)],
        current: usize,
        target: usize,
        seen: &mut Vec<usize>,
        out: &mut Vec<Vec<usize>>,
    ) {
        if current == target {
            out.push(seen.clone());
            return;
        }
        for &(a, b) in edges {
            if a == current && !seen.contains(&b) && b < n {
                seen.push(b);
                all_paths(n, edges, b, target, seen, out);
                seen.pop();
            }
        }
    }

    #[test]
    fn path_is_connected_and_minimal() {
        let signed = [
            (0, 1, 0.4),
            (1, 2, -0.3),
            (2, 5, 0.1),
            (0, 3, 0.9),
            (3, 4, 0.2),
            (4, 5, -0.6),
            (1, 4, 0.5),
            (5, 0, 0.7),
        ];
        let ds = dataset_with_edges(6, &signed);
        let edges: Vec<(usize, usize)> = signed.iter().map(|&(a, b, _)| (a, b)).collect();
        let edge_set: FxHashSet<(usize, usize)> = edges.iter().copied().collect();

        for source in 0..6 {
            for target in 0..6 {
                let mut found = Vec::new();
                all_paths(6, &edges, source, target, &mut vec![source], &mut found);
                let best = found.iter().map(|p| p.len()).min();
                match shortest_path(&ds, source, target, "velocity", ResolveOptions::default()) {
                    Ok(path) => {
                        assert_eq!(path.first(), Some(&source));
                        assert_eq!(path.last(), Some(&target));
                        for step in path.windows(2) {
                            assert!(edge_set.contains(&(step[0], step[1])), "{:?}", path);
                        }
                        assert_eq!(Some(path.len()), best);
                        // lexicographically smallest among the shortest
                        let smallest =
                            found.iter().filter(|p| p.len() == path.len()).min().unwrap();
                        assert_eq!(&path, smallest);
                    }
                    Err(EvoError::NoPath { .. }) => assert!(best.is_none()),
                    Err(e) => panic!("unexpected {:?}", e),
                }
            }
        }
    }

    #[test]
    fn cancelled_transitions_are_not_edges() {
        let mut ds = dataset_with_edges(3, &[(0, 1, 0.5), (1, 2, 0.5)]);
        let mut neg = SparseMatrix::new(3, 3);
        neg.add(0, 1, 0.5);
        ds.insert_graph("velocity_graph_neg", neg);
        assert!(matches!(
            shortest_path(&ds, 0, 2, "velocity", ResolveOptions::default()),
            Err(EvoError::NoPath { .. })
        ));
    }

    #[test]
    fn undirected_option_walks_edges_backwards() {
        let ds = dataset_with_edges(3, &[(1, 0, 0.5), (2, 1, 0.5)]);
        assert!(shortest_path(&ds, 0, 2, "velocity", ResolveOptions::default()).is_err());
        let opts = ResolveOptions { undirected: true };
        let path = shortest_path(&ds, 0, 2, "velocity", opts).unwrap();
        assert_eq!(path, vec![0, 1, 2]);
    }

    #[test]
    fn source_equal_to_target_is_a_single_node() {
        let ds = dataset_with_edges(2, &[(0, 1, 0.5)]);
        let path = shortest_path(&ds, 1, 1, "velocity", ResolveOptions::default()).unwrap();
        assert_eq!(path, vec![1]);
    }

    #[test]
    fn all_zero_distances_are_corrupted() {
        let text = "O\ts0\tA\tA\nO\ts1\tA\tA\nD\t0\t1\t0\n";
        let ds = parse_annotations(text).unwrap();
        // no graph either: the neighbor check must come first
        assert!(matches!(
            shortest_path(&ds, 0, 1, "velocity", ResolveOptions::default()),
            Err(EvoError::CorruptedNeighbors { .. })
        ));
    }

    #[test]
    fn missing_graph_is_reported() {
        let ds = dataset_with_edges(2, &[(0, 1, 0.5)]);
        assert!(matches!(
            shortest_path(&ds, 0, 1, "other", ResolveOptions::default()),
            Err(EvoError::MissingAnnotation { .. })
        ));
        assert!(matches!(
            shortest_path(&ds, 0, 9, "velocity", ResolveOptions::default()),
            Err(EvoError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn draw_requires_path_or_both_endpoints() {
        let ds = dataset_with_edges(3, &[(0, 1, 0.5)]);
        let output = OutputConfig::default();
        let request = PathRequest {
            source: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            draw_path(&ds, &request, None, &output),
            Err(EvoError::MissingArgument(_))
        ));
    }

    #[test]
    fn draw_requires_embedding() {
        let ds = dataset_with_edges(3, &[(0, 1, 0.5)]);
        let request = PathRequest {
            path: Some(vec![0, 1]),
            basis: "tsne".to_string(),
            ..Default::default()
        };
        match draw_path(&ds, &request, None, &OutputConfig::default()) {
            Err(EvoError::MissingAnnotation { key, .. }) => assert_eq!(key, "X_tsne"),
            other => panic!("unexpected {:?}", other.map(|f| f.shapes().len())),
        }
    }

    #[test]
    fn three_point_path_draws_two_segments_three_markers() {
        let ds = dataset_with_edges(4, &[(0, 1, 0.5), (1, 3, 0.5)]);
        let request = PathRequest {
            source: Some(0),
            target: Some(3),
            ..Default::default()
        };
        let fig = draw_path(&ds, &request, None, &OutputConfig::default()).unwrap();
        assert_eq!(fig.segment_count(), 2);
        assert_eq!(fig.marker_count(), 3);

        // lines sit below the markers
        let max_line = fig
            .shapes()
            .iter()
            .filter_map(|s| match s {
                Shape::Segment { zorder, .. } => Some(*zorder),
                _ => None,
            })
            .max()
            .unwrap();
        assert!(fig.shapes().iter().all(|s| match s {
            Shape::Marker { zorder, .. } => *zorder > max_line,
            _ => true,
        }));

        match &fig.shapes()[1] {
            Shape::Segment { from, to, .. } => {
                assert_eq!(*from, [1.0, 1.0]);
                assert_eq!(*to, [3.0, 9.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn colormap_colors_markers_by_progress() {
        let ds = dataset_with_edges(3, &[]);
        let cmap = Colormap::by_name("Greys").unwrap();
        let request = PathRequest {
            path: Some(vec![2, 0, 1]),
            style: PathStyle {
                cmap: Some(cmap),
                ..Default::default()
            },
            ..Default::default()
        };
        let fig = draw_path(&ds, &request, None, &OutputConfig::default()).unwrap();
        let fills: Vec<Rgb> = fig
            .shapes()
            .iter()
            .filter_map(|s| match s {
                Shape::Marker { fill, .. } => Some(*fill),
                _ => None,
            })
            .collect();
        assert_eq!(fills.first(), Some(&(255, 255, 255)));
        assert_eq!(fills.last(), Some(&(0, 0, 0)));
    }
}
