//! Prometheus text rendering for the serving generation.
//!
//! Every value belongs to the generation answering the scrape; counters start
//! from zero again after a restart.

use std::sync::atomic::Ordering;

use crate::server::AppState;

pub fn render_metrics(state: &AppState) -> String {
    let generation = &state.generation;

    let requests_total = generation.requests().total();
    let in_flight_requests = generation.active_requests();
    let open_connections = generation.open_connections();
    let count = state.count.load(Ordering::Relaxed);
    let generation_number = generation.number();
    let listeners = generation.registry().len();

    format!(
        concat!(
            "# HELP counterd_requests_total Requests started by this generation.\n",
            "# TYPE counterd_requests_total counter\n",
            "counterd_requests_total {requests_total}\n",
            "# HELP counterd_in_flight_requests Requests currently being served.\n",
            "# TYPE counterd_in_flight_requests gauge\n",
            "counterd_in_flight_requests {in_flight_requests}\n",
            "# HELP counterd_open_connections Open client connections.\n",
            "# TYPE counterd_open_connections gauge\n",
            "counterd_open_connections {open_connections}\n",
            "# HELP counterd_count Current value of the counter served at /.\n",
            "# TYPE counterd_count counter\n",
            "counterd_count {count}\n",
            "# HELP counterd_generation Restart generation of this process.\n",
            "# TYPE counterd_generation gauge\n",
            "counterd_generation {generation_number}\n",
            "# HELP counterd_listeners Open listening sockets.\n",
            "# TYPE counterd_listeners gauge\n",
            "counterd_listeners {listeners}\n"
        ),
        requests_total = requests_total,
        in_flight_requests = in_flight_requests,
        open_connections = open_connections,
        count = count,
        generation_number = generation_number,
        listeners = listeners
    )
}
