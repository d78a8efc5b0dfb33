use crate::phylo_tree::PhyloTree;
use matrix_util::common_io::read_lines;
use std::collections::HashMap;

/// Parse a Newick string into a [`PhyloTree`].
///
/// Unnamed nodes are called `node_{k}` where `k` is their level-order
/// position.
pub fn parse_newick(newick: &str) -> anyhow::Result<PhyloTree> {
    let tree = phylotree::tree::Tree::from_newick(newick.trim())
        .map_err(|e| anyhow::anyhow!("malformed newick: {:?}", e))?;

    let root = tree
        .get_root()
        .map_err(|e| anyhow::anyhow!("newick without root: {:?}", e))?;
    let level_order = tree
        .levelorder(&root)
        .map_err(|e| anyhow::anyhow!("newick traversal: {:?}", e))?;

    let mut idx_mapping: HashMap<usize, usize> = HashMap::with_capacity(level_order.len());
    let mut names = Vec::with_capacity(level_order.len());
    let mut parents = Vec::with_capacity(level_order.len());
    let mut lengths = Vec::with_capacity(level_order.len());

    for (k, node_idx) in level_order.iter().enumerate() {
        let node = tree
            .get(node_idx)
            .map_err(|e| anyhow::anyhow!("newick node {}: {:?}", node_idx, e))?;

        idx_mapping.insert(*node_idx, k);

        let name = match node.name.as_deref().map(str::trim) {
            Some(x) if !x.is_empty() => x.to_string(),
            _ => format!("node_{}", k),
        };
        names.push(name.into_boxed_str());

        let parent = match node.parent {
            Some(p) => Some(
                *idx_mapping
                    .get(&p)
                    .ok_or_else(|| anyhow::anyhow!("parent of {} not visited", k))?,
            ),
            None => None,
        };
        parents.push(parent);
        lengths.push(node.parent_edge);
    }

    PhyloTree::from_parents(names, parents, lengths)
}

/// Read a (possibly gzipped) Newick file
pub fn read_newick(file: &str) -> anyhow::Result<PhyloTree> {
    let newick = read_lines(file)?.join("");
    parse_newick(&newick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_internal_nodes_and_branch_lengths() -> anyhow::Result<()> {
        let tree = parse_newick("((A:0.1,B:0.2)X:0.5,(C:1,D:1)Y:0.5)R;")?;
        assert_eq!(tree.num_nodes(), 8);
        let mut leaves = tree.leaf_names();
        leaves.sort();
        let expected: Vec<Box<str>> = ["A", "B", "C", "D"].iter().map(|&s| s.into()).collect();
        assert_eq!(leaves, expected);

        let x = tree.id_of("X").expect("X");
        let a = tree.id_of("A").expect("A");
        assert_eq!(tree.node(a).parent, Some(x));
        approx::assert_abs_diff_eq!(tree.node(a).branch_length.unwrap_or(0.), 0.1);
        assert_eq!(tree.root(), tree.id_of("R").expect("R"));
        Ok(())
    }

    #[test]
    fn unnamed_internal_nodes_get_names() -> anyhow::Result<()> {
        let tree = parse_newick("((A,B),C);")?;
        let mut leaves: Vec<Box<str>> = tree.leaf_names();
        leaves.sort();
        assert_eq!(leaves, vec![Box::from("A"), Box::from("B"), Box::from("C")]);
        assert!(tree.id_of("node_0").is_some());
        Ok(())
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(parse_newick("((A,B);").is_err());
    }
}
