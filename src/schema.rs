table! {
    fout (id) {
        id -> Int4,
        sim_id -> Int4,
        files -> Nullable<Jsonb>,
    }
}

table! {
    job_info (id) {
        id -> Int4,
        sim_id -> Int4,
        job_id -> Int4,
    }
}

table! {
    param (id) {
        id -> Int4,
        sim_id -> Int4,
        path -> Nullable<Varchar>,
        cmd -> Varchar,
        args -> Jsonb,
    }
}

table! {
    sim (id) {
        id -> Int4,
        stat_id -> Int2,
        parent_id -> Nullable<Int4>,
    }
}

table! {
    sim_status_lookup (id) {
        stat_name -> Text,
        id -> Int2,
        description -> Nullable<Varchar>,
    }
}
