use crate::error::{Result, SysinfoError};

pub type NodeId = usize;

/// A raw `start-stop : label` interval as it appears in the kernel's
/// resource listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRegion {
    pub start: u64,
    pub stop: u64,
    pub label: String,
}

#[derive(Debug)]
pub struct Node {
    pub region: Option<RawRegion>,
    pub level: usize,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// The indentation-structured tree behind `/proc/iomem` and `/proc/ioports`.
///
/// Nodes live in an arena and refer to each other by index; the synthetic
/// root sits at index 0 with no region and level 0.
#[derive(Debug)]
pub struct ResourceTree {
    nodes: Vec<Node>,
}

impl ResourceTree {
    pub const ROOT: NodeId = 0;

    pub fn parse(text: &str) -> Result<Self> {
        let mut nodes = vec![Node {
            region: None,
            level: 0,
            parent: None,
            children: Vec::new(),
        }];

        let mut last: NodeId = Self::ROOT;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let (level, region) = parse_line(line)?;

            let parent = if level > nodes[last].level {
                last
            } else if level == nodes[last].level {
                nodes[last].parent.ok_or_else(|| SysinfoError::BadIndentation {
                    line: line.to_string(),
                })?
            } else {
                // Level drop: climb until an ancestor shallower than the new
                // node is found.
                let mut p = nodes[last].parent;
                loop {
                    let id = p.ok_or_else(|| SysinfoError::BadIndentation {
                        line: line.to_string(),
                    })?;
                    if nodes[id].level < level {
                        break id;
                    }
                    p = nodes[id].parent;
                }
            };

            let id = nodes.len();
            nodes.push(Node {
                region: Some(region),
                level,
                parent: Some(parent),
                children: Vec::new(),
            });
            nodes[parent].children.push(id);
            last = id;
        }

        Ok(Self { nodes })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// All leaf regions, depth-first.
    pub fn leaves(&self) -> Vec<&RawRegion> {
        let mut out = Vec::new();
        self.collect_leaves(Self::ROOT, &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, id: NodeId, out: &mut Vec<&'a RawRegion>) {
        let node = &self.nodes[id];
        if node.children.is_empty() {
            if let Some(r) = &node.region {
                out.push(r);
            }
        } else {
            for &child in &node.children {
                self.collect_leaves(child, out);
            }
        }
    }

    /// All regions whose label contains `name`, at any depth.
    pub fn find_by_name(&self, name: &str) -> Vec<&RawRegion> {
        self.nodes
            .iter()
            .filter_map(|n| n.region.as_ref())
            .filter(|r| r.label.contains(name))
            .collect()
    }
}

fn parse_line(line: &str) -> Result<(usize, RawRegion)> {
    let malformed = || SysinfoError::MalformedLine {
        line: line.to_string(),
    };

    let (range, label) = line.split_once(" : ").ok_or_else(malformed)?;
    let level = range.chars().take_while(|&c| c == ' ').count() / 2 + 1;
    let (start, stop) = range.trim().split_once('-').ok_or_else(malformed)?;
    let start = u64::from_str_radix(start.trim(), 16).map_err(|_| malformed())?;
    let stop = u64::from_str_radix(stop.trim(), 16).map_err(|_| malformed())?;

    Ok((
        level,
        RawRegion {
            start,
            stop,
            label: label.trim().to_string(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IOMEM: &str = "\
00000000-00000fff : Reserved
00001000-0009ffff : System RAM
000a0000-000bffff : PCI Bus 0000:00
00100000-3fffffff : System RAM
  01000000-01a02fff : Kernel code
  01a03000-01ee57ff : Kernel data
40000000-403fffff : PCI Bus 0000:02
  40000000-4000ffff : 0000:02:00.0
    40000000-4000ffff : e1000e
";

    #[test]
    fn parses_levels_from_indentation() {
        let tree = ResourceTree::parse(IOMEM).unwrap();
        let top = tree.children(ResourceTree::ROOT);
        assert_eq!(top.len(), 5);

        let ram = tree.node(top[3]);
        assert_eq!(ram.level, 1);
        assert_eq!(ram.children.len(), 2);
        let code = tree.node(ram.children[0]);
        assert_eq!(code.level, 2);
        assert_eq!(code.region.as_ref().unwrap().label, "Kernel code");

        let bus = tree.node(top[4]);
        let dev = tree.node(bus.children[0]);
        assert_eq!(dev.level, 2);
        let driver = tree.node(dev.children[0]);
        assert_eq!(driver.level, 3);
        assert_eq!(driver.region.as_ref().unwrap().label, "e1000e");
    }

    #[test]
    fn level_drop_reattaches_to_ancestor() {
        let text = "\
00000000-0000ffff : a
  00000000-000000ff : b
    00000000-0000000f : c
00010000-0001ffff : d
";
        let tree = ResourceTree::parse(text).unwrap();
        let top = tree.children(ResourceTree::ROOT);
        assert_eq!(top.len(), 2);
        assert_eq!(tree.node(top[1]).region.as_ref().unwrap().label, "d");
    }

    #[test]
    fn leaves_are_collected_depth_first() {
        let tree = ResourceTree::parse(IOMEM).unwrap();
        let labels: Vec<&str> = tree.leaves().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(
            labels,
            [
                "Reserved",
                "System RAM",
                "PCI Bus 0000:00",
                "Kernel code",
                "Kernel data",
                "e1000e",
            ]
        );
    }

    #[test]
    fn find_by_name_searches_all_depths() {
        let tree = ResourceTree::parse(IOMEM).unwrap();
        let kernel = tree.find_by_name("Kernel");
        assert_eq!(kernel.len(), 2);
        assert_eq!(tree.find_by_name("e1000e").len(), 1);
        assert!(tree.find_by_name("nothing here").is_empty());
    }

    #[test]
    fn malformed_line_is_rejected() {
        let err = ResourceTree::parse("not a resource line\n").unwrap_err();
        assert!(matches!(err, SysinfoError::MalformedLine { .. }));

        let err = ResourceTree::parse("000zz000-0000ffff : a\n").unwrap_err();
        assert!(matches!(err, SysinfoError::MalformedLine { .. }));
    }
}
