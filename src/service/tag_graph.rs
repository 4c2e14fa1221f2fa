//! Tag co-occurrence graph.
//!
//! Every asset contributes one node per distinct tag and one edge per
//! unordered pair of tags it carries. Tag identity is case-insensitive; the
//! first spelling seen is the one displayed.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// One tag and the number of assets carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagGraphNode {
    pub name: String,
    pub count: usize,
}

/// An undirected co-occurrence edge. `source` always sorts before `target`
/// case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagGraphLink {
    pub source: String,
    pub target: String,
    pub weight: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagGraph {
    pub nodes: Vec<TagGraphNode>,
    pub links: Vec<TagGraphLink>,
}

/// Build the co-occurrence graph over `(path, tags)` rows.
///
/// Nodes are ordered by descending asset count, ties broken by name; when
/// `max_tags` is set only the top entries survive. Links weigh the number of
/// assets carrying both endpoints, keep only weights of at least
/// `min_cooccurrence`, never reference a pruned node, and are ordered by
/// descending weight with ties in pair order.
pub fn build_tag_graph(
    entries: &[(String, Vec<String>)],
    min_cooccurrence: usize,
    max_tags: Option<usize>,
) -> TagGraph {
    let mut spellings: BTreeMap<String, String> = BTreeMap::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut weights: BTreeMap<(String, String), usize> = BTreeMap::new();

    for (_, tags) in entries {
        // Case-normalized set, so "Tank" and "tank" on one asset count once.
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for tag in tags {
            let trimmed = tag.trim();
            if trimmed.is_empty() {
                continue;
            }
            let key = trimmed.to_lowercase();
            spellings
                .entry(key.clone())
                .or_insert_with(|| trimmed.to_string());
            seen.insert(key);
        }

        for key in &seen {
            *counts.entry(key.clone()).or_insert(0) += 1;
        }

        // The set iterates sorted, so each unordered pair shows up exactly
        // once, already in pair order.
        let keys: Vec<&String> = seen.iter().collect();
        for (i, first) in keys.iter().enumerate() {
            for second in &keys[i + 1..] {
                *weights
                    .entry(((*first).clone(), (*second).clone()))
                    .or_insert(0) += 1;
            }
        }
    }

    let mut ranked: Vec<(&String, usize)> = counts.iter().map(|(key, n)| (key, *n)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    if let Some(cap) = max_tags {
        ranked.truncate(cap);
    }
    let surviving: BTreeSet<&String> = ranked.iter().map(|(key, _)| *key).collect();

    let nodes = ranked
        .iter()
        .map(|(key, count)| TagGraphNode {
            name: spellings[*key].clone(),
            count: *count,
        })
        .collect();

    // The weight map iterates in pair order; a stable sort on weight keeps
    // that order within equal weights.
    let mut links: Vec<TagGraphLink> = weights
        .iter()
        .filter(|((a, b), weight)| {
            **weight >= min_cooccurrence && surviving.contains(a) && surviving.contains(b)
        })
        .map(|((a, b), weight)| TagGraphLink {
            source: spellings[a].clone(),
            target: spellings[b].clone(),
            weight: *weight,
        })
        .collect();
    links.sort_by(|a, b| b.weight.cmp(&a.weight));

    TagGraph { nodes, links }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, tags: &[&str]) -> (String, Vec<String>) {
        (
            path.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        )
    }

    #[test]
    fn co_tagged_assets_share_one_weighted_edge() {
        let entries = vec![
            entry("a.stl", &["bracket", "printed"]),
            entry("b.stl", &["bracket", "printed"]),
        ];

        let graph = build_tag_graph(&entries, 1, None);
        assert_eq!(
            graph.nodes,
            vec![
                TagGraphNode {
                    name: "bracket".to_string(),
                    count: 2
                },
                TagGraphNode {
                    name: "printed".to_string(),
                    count: 2
                },
            ]
        );
        assert_eq!(
            graph.links,
            vec![TagGraphLink {
                source: "bracket".to_string(),
                target: "printed".to_string(),
                weight: 2
            }]
        );
    }

    #[test]
    fn node_cap_drops_edges_to_pruned_tags() {
        let entries = vec![
            entry("a.stl", &["bracket", "printed"]),
            entry("b.stl", &["bracket", "printed"]),
            entry("c.stl", &["bracket"]),
        ];

        let graph = build_tag_graph(&entries, 1, Some(1));
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].name, "bracket");
        assert_eq!(graph.nodes[0].count, 3);
        assert!(graph.links.is_empty());
    }

    #[test]
    fn weak_edges_fall_below_the_threshold() {
        let entries = vec![
            entry("a.stl", &["bracket", "printed"]),
            entry("b.stl", &["bracket", "printed"]),
            entry("c.stl", &["bracket", "resin"]),
        ];

        let graph = build_tag_graph(&entries, 2, None);
        assert_eq!(graph.links.len(), 1);
        assert_eq!(graph.links[0].source, "bracket");
        assert_eq!(graph.links[0].target, "printed");

        // Threshold 1 readmits the single-asset pairs.
        let graph = build_tag_graph(&entries, 1, None);
        assert_eq!(graph.links.len(), 3);
    }

    #[test]
    fn tag_case_collapses_to_the_first_spelling() {
        let entries = vec![
            entry("a.stl", &["Tank", "hull"]),
            entry("b.stl", &["tank", "hull"]),
        ];

        let graph = build_tag_graph(&entries, 1, None);
        let tank = graph
            .nodes
            .iter()
            .find(|node| node.name.eq_ignore_ascii_case("tank"))
            .unwrap();
        assert_eq!(tank.name, "Tank");
        assert_eq!(tank.count, 2);
        assert_eq!(graph.links.len(), 1);
        assert_eq!(graph.links[0].weight, 2);
    }

    #[test]
    fn duplicate_tags_on_one_asset_count_once() {
        let entries = vec![entry("a.stl", &["bracket", "Bracket", " bracket "])];

        let graph = build_tag_graph(&entries, 0, None);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].count, 1);
        assert!(graph.links.is_empty());
    }

    #[test]
    fn nodes_rank_by_count_then_name() {
        let entries = vec![
            entry("a.stl", &["zeta", "alpha"]),
            entry("b.stl", &["zeta", "mid"]),
            entry("c.stl", &["mid"]),
        ];

        let graph = build_tag_graph(&entries, 1, None);
        let names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["mid", "zeta", "alpha"]);
    }

    #[test]
    fn links_rank_by_weight_then_pair_order() {
        let entries = vec![
            entry("a.stl", &["a", "b"]),
            entry("b.stl", &["a", "b"]),
            entry("c.stl", &["a", "c"]),
            entry("d.stl", &["b", "c"]),
        ];

        let graph = build_tag_graph(&entries, 1, None);
        let pairs: Vec<(&str, &str, usize)> = graph
            .links
            .iter()
            .map(|l| (l.source.as_str(), l.target.as_str(), l.weight))
            .collect();
        assert_eq!(pairs, vec![("a", "b", 2), ("a", "c", 1), ("b", "c", 1)]);
    }

    #[test]
    fn empty_input_yields_an_empty_graph() {
        let graph = build_tag_graph(&[], 1, None);
        assert!(graph.nodes.is_empty());
        assert!(graph.links.is_empty());
    }
}
