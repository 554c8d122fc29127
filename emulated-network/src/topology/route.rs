use crate::topology::ip::Ipv4Cidr;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub destination: RouteDestination,
    pub next: Ipv4Addr,
}

impl Route {
    pub fn default_via(next: Ipv4Addr) -> Self {
        Self {
            destination: RouteDestination::Default,
            next,
        }
    }

    pub fn next_hop_towards_destination(&self, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.destination.contains(ip) {
            Some(self.next)
        } else {
            None
        }
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via {}", self.destination, self.next)
    }
}

impl FromStr for Route {
    type Err = anyhow::Error;

    // `<destination> via <next hop>`, as printed by `ip route`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((destination, next)) = s.split_once(" via ") else {
            anyhow::bail!("expected `<destination> via <next hop>`, found `{s}`");
        };

        Ok(Route {
            destination: destination.trim().parse()?,
            next: next.trim().parse()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteDestination {
    Default,
    Network(Ipv4Cidr),
}

impl RouteDestination {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        match self {
            RouteDestination::Default => true,
            RouteDestination::Network(cidr) => cidr.contains(ip),
        }
    }

    /// Used for longest-prefix matching
    pub fn prefix_len(&self) -> u8 {
        match self {
            RouteDestination::Default => 0,
            RouteDestination::Network(cidr) => cidr.network_prefix(),
        }
    }
}

impl Display for RouteDestination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteDestination::Default => f.write_str("default"),
            RouteDestination::Network(cidr) => {
                write!(f, "{}/{}", cidr.network(), cidr.network_prefix())
            }
        }
    }
}

impl FromStr for RouteDestination {
    type Err = anyhow::Error;

    // Either `default` or a range in CIDR syntax (e.g. 172.16.10.0/24)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "default" {
            return Ok(RouteDestination::Default);
        }

        let cidr: Ipv4Cidr = s.parse()?;
        Ok(RouteDestination::Network(cidr.subnet()))
    }
}

#[test]
fn test_route_destination() {
    let cases = [
        ("default", "default", "8.8.8.8", true),
        ("172.16.10.0/24", "172.16.10.0/24", "172.16.10.11", true),
        ("172.16.10.99/24", "172.16.10.0/24", "10.1.1.2", false),
    ];

    for (input, display, ip, contained) in cases {
        let destination = RouteDestination::from_str(input).unwrap();
        assert_eq!(destination.to_string(), display);
        assert_eq!(destination.contains(ip.parse().unwrap()), contained);
    }
}

#[test]
fn test_parse_route() {
    let route: Route = "default via 10.1.1.1".parse().unwrap();
    assert_eq!(route, Route::default_via(Ipv4Addr::new(10, 1, 1, 1)));

    let route: Route = "172.16.10.0/24 via 10.0.0.1".parse().unwrap();
    assert_eq!(route.to_string(), "172.16.10.0/24 via 10.0.0.1");
    assert_eq!(
        route.next_hop_towards_destination(Ipv4Addr::new(172, 16, 10, 12)),
        Some(Ipv4Addr::new(10, 0, 0, 1))
    );

    assert!("172.16.10.0/24".parse::<Route>().is_err());
}
