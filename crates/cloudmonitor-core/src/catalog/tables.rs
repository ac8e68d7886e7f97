//! Static metric tables, one array of records per CloudMonitor namespace.
//!
//! Names already published by earlier releases of the exporter are kept
//! as-is so existing dashboards keep working.

use super::{CategoryId, Unit, ValueSelector};

/// One row of a category table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntrySpec {
    pub upstream: &'static str,
    /// Exported name without the namespace and subsystem prefix.
    pub name: &'static str,
    pub help: &'static str,
    pub unit: Unit,
    pub selector: ValueSelector,
}

impl EntrySpec {
    pub(crate) const fn average(
        upstream: &'static str,
        name: &'static str,
        help: &'static str,
        unit: Unit,
    ) -> Self {
        Self {
            upstream,
            name,
            help,
            unit,
            selector: ValueSelector::Average,
        }
    }

    const fn select(mut self, selector: ValueSelector) -> Self {
        self.selector = selector;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CategorySpec {
    pub id: CategoryId,
    pub namespace: &'static str,
    pub subsystem: &'static str,
    pub entries: &'static [EntrySpec],
}

pub(crate) const BUILTIN: &[CategorySpec] = &[NAT_GATEWAY, LOAD_BALANCER, DATABASE];

// NAT gateway names predate the subsystem prefix.
const NAT_GATEWAY: CategorySpec = CategorySpec {
    id: CategoryId::NatGateway,
    namespace: "acs_nat_gateway",
    subsystem: "",
    entries: &[
        EntrySpec::average(
            "net_tx.rate",
            "net_tx_rate_bytes",
            "Outbound bandwith of gateway in bits/s",
            Unit::Bytes,
        )
        .select(ValueSelector::Value),
        EntrySpec::average(
            "net_tx.ratePercent",
            "net_tx_rate_percent",
            "Outbound bandwith of gateway used in percentage",
            Unit::Percent,
        )
        .select(ValueSelector::Value),
        EntrySpec::average(
            "SnatConnection",
            "snat_connections",
            "Max number of snat connections per minute",
            Unit::Count,
        )
        .select(ValueSelector::Maximum),
    ],
};

const LOAD_BALANCER: CategorySpec = CategorySpec {
    id: CategoryId::LoadBalancer,
    namespace: "acs_slb_dashboard",
    subsystem: "slb",
    entries: &[
        // Layer-4
        EntrySpec::average(
            "ActiveConnection",
            "active_connection",
            "Active connections per port",
            Unit::Count,
        ),
        EntrySpec::average(
            "InstanceTrafficRX",
            "traffic_rx_average",
            "Average traffic received per second",
            Unit::Bytes,
        ),
        EntrySpec::average(
            "InstanceTrafficTX",
            "traffic_tx_average",
            "Average traffic sent per second",
            Unit::Bytes,
        ),
        EntrySpec::average(
            "InstanceNewConnectionUtilization",
            "new_connection_utilization",
            "Average number of new connections created per second in percentage",
            Unit::Percent,
        ),
        EntrySpec::average(
            "InstanceRt",
            "request_time",
            "slb request time",
            Unit::None,
        ),
        EntrySpec::average(
            "InstanceStatusCode5xx",
            "status_code_5xx",
            "5xx error in the instance itself",
            Unit::Count,
        ),
        EntrySpec::average(
            "InstanceUpstreamCode5xx",
            "upstream_code_5xx",
            "Backend server 5xx error",
            Unit::Count,
        ),
        EntrySpec::average(
            "MaxConnection",
            "max_connection",
            "Concurrent connections per port",
            Unit::Count,
        ),
        EntrySpec::average(
            "DropConnection",
            "drop_connection",
            "Connections dropped per second",
            Unit::Count,
        ),
        EntrySpec::average(
            "DropPacketRX",
            "drop_packet_rx",
            "Inbound packets dropped per second",
            Unit::Count,
        ),
        EntrySpec::average(
            "DropPacketTX",
            "drop_packet_tx",
            "Outbound packets dropped per second",
            Unit::Count,
        ),
        EntrySpec::average(
            "DropTrafficRX",
            "drop_traffic_rx",
            "Inbound traffic dropped in bits/s",
            Unit::Bytes,
        ),
        EntrySpec::average(
            "DropTrafficTX",
            "drop_traffic_tx",
            "Outbound traffic dropped in bits/s",
            Unit::Bytes,
        ),
        // Layer-7
        EntrySpec::average("Qps", "qps", "Seven-layer protocol port Queries-per-second", Unit::Count),
        EntrySpec::average(
            "InstanceQps",
            "instance_qps",
            "Seven-layer protocol instance Queries-per-second",
            Unit::Count,
        ),
        EntrySpec::average(
            "InstanceQpsUtilization",
            "instance_qps_utilization",
            "Seven-layer protocol instance Queries-per-second used in percentage",
            Unit::Percent,
        ),
        EntrySpec::average("Rt", "port_request_time", "Seven-layer protocol port request time", Unit::None),
        EntrySpec::average(
            "StatusCode5xx",
            "port_status_code_5xx",
            "5xx responses per second returned by the port",
            Unit::Count,
        ),
        EntrySpec::average(
            "UpstreamCode4xx",
            "port_upstream_code_4xx",
            "4xx responses per second returned by backend servers of the port",
            Unit::Count,
        ),
        EntrySpec::average(
            "UpstreamCode5xx",
            "port_upstream_code_5xx",
            "5xx responses per second returned by backend servers of the port",
            Unit::Count,
        ),
        EntrySpec::average(
            "UpstreamRt",
            "port_upstream_request_time",
            "Backend server response time of the port",
            Unit::None,
        ),
    ],
};

const DATABASE: CategorySpec = CategorySpec {
    id: CategoryId::Database,
    namespace: "acs_rds_dashboard",
    subsystem: "rds",
    entries: &[
        EntrySpec::average("CpuUsage", "cpu_usage_average", "CPU usage per minute", Unit::Percent),
        EntrySpec::average(
            "ConnectionUsage",
            "connection_usage",
            "Connection usage per minute",
            Unit::Percent,
        ),
        EntrySpec::average(
            "MySQL_ActiveSessions",
            "active_sessions",
            "Active sessions per minute",
            Unit::Count,
        ),
    ],
};
